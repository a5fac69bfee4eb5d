//! Browser client against a real bridge over loopback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbridge_browser::{
    BrowserConfig, BrowserError, BrowserHandle, CaptureOptions, CaptureTarget, Collaborators,
    ConnectionState, DomExtractor, Image, PageController, ReconnectPolicy, Renderer,
    ScriptEvaluator,
};
use devbridge_core::commands::ImageFormat;
use devbridge_core::{LogEntry, LogLevel, SaveKind};
use devbridge_server::{BridgeServer, ServerConfig, ServerHandle};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct StaticPage;

#[async_trait]
impl Renderer for StaticPage {
    async fn capture(
        &self,
        _target: &CaptureTarget,
        options: &CaptureOptions,
    ) -> Result<Image, BrowserError> {
        Ok(Image {
            format: options.format,
            bytes: vec![0x89, b'P', b'N', b'G'],
            width: 1280,
            height: 720,
        })
    }
}

impl DomExtractor for StaticPage {
    fn outline(&self) -> Result<Value, BrowserError> {
        Ok(json!([{"level": 1, "text": "Dashboard"}]))
    }
    fn schema(&self) -> Result<Value, BrowserError> {
        Ok(json!([]))
    }
    fn a11y(&self) -> Result<Value, BrowserError> {
        Ok(json!({"violations": []}))
    }
    fn query(&self, selector: &str, _all: bool) -> Result<Value, BrowserError> {
        Ok(json!({"selector": selector, "count": 1}))
    }
}

#[async_trait]
impl PageController for StaticPage {
    async fn click(&self, selector: &str) -> Result<Value, BrowserError> {
        Ok(json!({"clicked": selector}))
    }
    async fn refresh(&self, _hard: bool) -> Result<(), BrowserError> {
        Ok(())
    }
    fn network_log(&self, _limit: Option<usize>) -> Result<Value, BrowserError> {
        Ok(json!({"entries": []}))
    }
}

#[async_trait]
impl ScriptEvaluator for StaticPage {
    async fn eval(&self, _code: &str) -> Result<Value, BrowserError> {
        Ok(Value::Null)
    }
}

fn collaborators() -> Collaborators {
    let page = Arc::new(StaticPage);
    Collaborators {
        renderer: page.clone(),
        dom: page.clone(),
        page: page.clone(),
        script: page,
    }
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_attempts: 3,
        verify_timeout: Duration::from_secs(2),
    }
}

async fn boot_bridge(dir: &tempfile::TempDir) -> ServerHandle {
    BridgeServer::new(ServerConfig {
        output_dir: dir.path().to_path_buf(),
        ..ServerConfig::default()
    })
    .listen()
    .await
    .unwrap()
}

fn browser(url: String) -> BrowserHandle {
    let config = BrowserConfig {
        policy: fast_policy(),
        ..BrowserConfig::default().with_url(url)
    };
    BrowserHandle::spawn(config, collaborators())
}

async fn verified(handle: &BrowserHandle) {
    let state = timeout(TIMEOUT, handle.wait_for(ConnectionState::is_verified))
        .await
        .expect("browser never verified");
    assert!(state.is_verified());
}

async fn agent(url: &str) -> WsStream {
    let (mut ws, _) = connect_async(url).await.unwrap();
    let greeting = read_json(&mut ws).await;
    assert_eq!(greeting["type"], "connection-established");
    ws
}

async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Read until a frame of type `kind` arrives.
async fn read_type(ws: &mut WsStream, kind: &str) -> Value {
    loop {
        let value = read_json(ws).await;
        if value["type"] == kind {
            return value;
        }
    }
}

#[tokio::test]
async fn browser_verifies_and_bridge_sees_it() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = boot_bridge(&dir).await;
    let handle = browser(bridge.ws_url());

    verified(&handle).await;
    assert!(bridge.router().browser_connected());

    handle.shutdown().await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn screenshot_round_trip_through_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = boot_bridge(&dir).await;
    let handle = browser(bridge.ws_url());
    verified(&handle).await;

    let mut ws = agent(&bridge.ws_url()).await;
    send_json(
        &mut ws,
        json!({"type": "screenshot", "requestId": "shot-1", "format": "jpeg"}),
    )
    .await;
    let reply = read_type(&mut ws, "screenshot-response").await;
    assert_eq!(reply["requestId"], "shot-1");
    assert_eq!(reply["success"], true);
    assert!(
        reply["data"]["screenshot"]
            .as_str()
            .unwrap()
            .starts_with(&format!("data:{};base64,", ImageFormat::Jpeg.mime()))
    );
    assert_eq!(bridge.router().pending_count(), 0);

    handle.shutdown().await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn console_log_reaches_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = boot_bridge(&dir).await;
    let handle = browser(bridge.ws_url());
    verified(&handle).await;

    let mut ws = agent(&bridge.ws_url()).await;
    send_json(
        &mut ws,
        json!({"type": "log-subscribe", "requestId": "s", "subscriptionId": "errors",
               "filters": {"levels": ["error"]}}),
    )
    .await;
    let ack = read_type(&mut ws, "log-subscribe-response").await;
    assert_eq!(ack["success"], true);

    handle.log(LogEntry::new(LogLevel::Info, "ignored"));
    handle.log(LogEntry::new(LogLevel::Error, "TypeError: x is undefined"));

    let event = read_type(&mut ws, "log-event").await;
    assert_eq!(event["subscriptionId"], "errors");
    assert_eq!(event["data"]["message"], "TypeError: x is undefined");
    assert_eq!(handle.logs().len(), 2);

    handle.shutdown().await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn agent_save_is_persisted_and_relayed() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = boot_bridge(&dir).await;
    let handle = browser(bridge.ws_url());
    verified(&handle).await;

    let mut ws = agent(&bridge.ws_url()).await;
    send_json(&mut ws, json!({"type": "save-outline", "requestId": "save-1"})).await;
    let reply = read_type(&mut ws, "outline-saved").await;
    assert_eq!(reply["requestId"], "save-1");
    let path = reply["data"]["path"].as_str().unwrap().to_owned();
    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved[0]["text"], "Dashboard");

    handle.shutdown().await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn toolbar_save_writes_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = boot_bridge(&dir).await;
    let handle = browser(bridge.ws_url());
    verified(&handle).await;

    assert!(handle.save(SaveKind::A11y).await.unwrap());
    let a11y_dir = dir.path().join("a11y");
    timeout(TIMEOUT, async {
        while std::fs::read_dir(&a11y_dir).map_or(0, Iterator::count) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("artifact never written");

    handle.shutdown().await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn hmr_capture_is_fanned_out() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = boot_bridge(&dir).await;
    let mut config = BrowserConfig::default().with_url(bridge.ws_url());
    config.policy = fast_policy();
    config.hmr.debounce_ms = 50;
    config.hmr.capture_delay_ms = 10;
    let handle = BrowserHandle::spawn(config, collaborators());
    verified(&handle).await;

    let mut ws = agent(&bridge.ws_url()).await;
    send_json(&mut ws, json!({"type": "subscribe", "requestId": "h", "channel": "hmr"})).await;
    let _ = read_type(&mut ws, "subscribe-response").await;

    handle.trigger_hmr();
    let event = read_type(&mut ws, "channel-event").await;
    assert_eq!(event["channel"], "hmr");
    assert_eq!(event["data"]["sequence"], 1);
    assert!(event["data"]["data"]["screenshot"].is_string());

    handle.shutdown().await;
    bridge.shutdown().await;
}

#[tokio::test]
async fn gives_up_when_bridge_is_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let handle = browser(format!("ws://127.0.0.1:{port}/ws"));
    let state = timeout(TIMEOUT, handle.wait_for(|s| s == ConnectionState::GaveUp))
        .await
        .expect("never gave up");
    assert_eq!(state, ConnectionState::GaveUp);

    handle.shutdown().await;
}

#[tokio::test]
async fn bridge_shutdown_drops_verification() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = boot_bridge(&dir).await;
    let handle = browser(bridge.ws_url());
    verified(&handle).await;

    bridge.shutdown().await;
    let state = timeout(TIMEOUT, handle.wait_for(|s| !s.is_verified()))
        .await
        .expect("loss never noticed");
    assert!(!state.is_verified());

    handle.shutdown().await;
}

/// Lifecycle `event` names seen on `ws` within `window`.
async fn lifecycle_events(ws: &mut WsStream, window: Duration) -> Vec<String> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(Ok(msg))) = tokio::time::timeout_at(deadline, ws.next()).await {
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["channel"] == "lifecycle" {
                events.push(value["data"]["event"].as_str().unwrap_or_default().to_owned());
            }
        }
    }
    events
}

#[tokio::test]
async fn displaced_browser_stays_down_until_manual_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = boot_bridge(&dir).await;
    let mut ws = agent(&bridge.ws_url()).await;
    send_json(
        &mut ws,
        json!({"type": "subscribe", "requestId": "l", "channel": "lifecycle"}),
    )
    .await;
    let _ = read_type(&mut ws, "subscribe-response").await;

    let first = browser(bridge.ws_url());
    verified(&first).await;
    let second = browser(bridge.ws_url());
    verified(&second).await;

    let state = timeout(TIMEOUT, first.wait_for(|s| s == ConnectionState::Replaced))
        .await
        .expect("first browser never saw the takeover");
    assert_eq!(state, ConnectionState::Replaced);

    // One connect per browser and one disconnect for the takeover, then quiet.
    let events = lifecycle_events(&mut ws, Duration::from_millis(500)).await;
    let connects = events.iter().filter(|e| *e == "browser-connected").count();
    assert_eq!(connects, 2, "events: {events:?}");
    assert_eq!(first.state(), ConnectionState::Replaced);
    assert!(second.state().is_verified());

    // A manual reconnect takes the slot back once.
    first.reconnect();
    verified(&first).await;
    let state = timeout(TIMEOUT, second.wait_for(|s| s == ConnectionState::Replaced))
        .await
        .expect("second browser never saw the takeover");
    assert_eq!(state, ConnectionState::Replaced);
    assert!(bridge.router().browser_connected());

    first.shutdown().await;
    second.shutdown().await;
    bridge.shutdown().await;
}
