//! End-to-end tests against a bound bridge with real WebSocket clients.

use std::time::Duration;

use devbridge_server::{BridgeServer, ServerConfig, ServerHandle};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot(dir: &tempfile::TempDir, request_timeout_ms: u64) -> ServerHandle {
    BridgeServer::new(ServerConfig {
        output_dir: dir.path().to_path_buf(),
        request_timeout_ms,
        ..ServerConfig::default()
    })
    .listen()
    .await
    .unwrap()
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

async fn read_type(ws: &mut WsStream, kind: &str) -> Value {
    loop {
        let value = read_json(ws).await;
        if value["type"] == kind {
            return value;
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Connect and consume the greeting.
async fn connect(handle: &ServerHandle) -> (WsStream, Value) {
    let (mut ws, _) = connect_async(handle.ws_url()).await.unwrap();
    let greeting = read_json(&mut ws).await;
    (ws, greeting)
}

async fn browser(handle: &ServerHandle) -> WsStream {
    let (mut ws, _) = connect(handle).await;
    send_json(
        &mut ws,
        json!({"type": "hello", "role": "browser", "url": "http://localhost:3000/"}),
    )
    .await;
    let ack = read_type(&mut ws, "hello-response").await;
    assert_eq!(ack["success"], true);
    ws
}

#[tokio::test]
async fn greeting_carries_connection_id() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;

    let (_ws, greeting) = connect(&handle).await;
    assert_eq!(greeting["type"], "connection-established");
    assert!(
        greeting["data"]["connectionId"]
            .as_str()
            .unwrap()
            .starts_with("conn_")
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn screenshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let mut page = browser(&handle).await;
    let (mut agent, _) = connect(&handle).await;

    send_json(
        &mut agent,
        json!({"type": "screenshot", "requestId": "r-1", "selector": "#app"}),
    )
    .await;

    let forwarded = read_type(&mut page, "screenshot").await;
    assert_eq!(forwarded["requestId"], "r-1");
    assert_eq!(forwarded["selector"], "#app");

    send_json(
        &mut page,
        json!({"type": "screenshot-response", "requestId": "r-1", "success": true,
               "data": {"screenshot": "data:image/png;base64,AAAA"}}),
    )
    .await;

    let reply = read_type(&mut agent, "screenshot-response").await;
    assert_eq!(reply["requestId"], "r-1");
    assert_eq!(reply["success"], true);
    assert_eq!(reply["data"]["screenshot"], "data:image/png;base64,AAAA");
    assert_eq!(handle.router().pending_count(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn request_without_browser_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let (mut agent, _) = connect(&handle).await;

    let started = tokio::time::Instant::now();
    send_json(&mut agent, json!({"type": "get-logs", "requestId": "r-2"})).await;
    let reply = read_json(&mut agent).await;
    assert_eq!(reply["type"], "get-logs-response");
    assert_eq!(reply["requestId"], "r-2");
    assert_eq!(reply["success"], false);
    assert_eq!(reply["error"], "no-browser-connected");
    assert!(started.elapsed() < Duration::from_secs(1));

    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let (mut agent, _) = connect(&handle).await;

    send_json(&mut agent, json!({"type": "teleport", "requestId": "r-3"})).await;
    let reply = read_json(&mut agent).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["requestId"], "r-3");
    assert_eq!(reply["error"], "unknown-command");

    handle.shutdown().await;
}

#[tokio::test]
async fn silent_browser_times_out_once() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 150).await;
    let mut page = browser(&handle).await;
    let (mut agent, _) = connect(&handle).await;

    send_json(&mut agent, json!({"type": "get-outline", "requestId": "r-4"})).await;
    let _ = read_type(&mut page, "get-outline").await;

    let reply = read_json(&mut agent).await;
    assert_eq!(reply["type"], "get-outline-response");
    assert_eq!(reply["error"], "timeout");

    // A late answer is dropped, not delivered as a second reply.
    send_json(
        &mut page,
        json!({"type": "get-outline-response", "requestId": "r-4", "success": true, "data": []}),
    )
    .await;
    send_json(&mut agent, json!({"type": "ping", "requestId": "after"})).await;
    let next = read_json(&mut agent).await;
    assert_eq!(next["type"], "pong");
    assert_eq!(next["requestId"], "after");

    handle.shutdown().await;
}

#[tokio::test]
async fn browser_disconnect_fails_pending_requests() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let mut page = browser(&handle).await;
    let (mut agent, _) = connect(&handle).await;

    send_json(&mut agent, json!({"type": "click", "requestId": "r-5", "selector": "a"})).await;
    let _ = read_type(&mut page, "click").await;
    drop(page);

    let reply = read_json(&mut agent).await;
    assert_eq!(reply["requestId"], "r-5");
    assert_eq!(reply["error"], "browser-disconnected");
    assert_eq!(handle.router().pending_count(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn console_logs_fan_out_by_filter() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let mut page = browser(&handle).await;
    let (mut agent, _) = connect(&handle).await;

    send_json(
        &mut agent,
        json!({"type": "log-subscribe", "requestId": "s", "subscriptionId": "warns",
               "filters": {"levels": ["warn"], "pattern": "deprecated"}}),
    )
    .await;
    assert_eq!(read_type(&mut agent, "log-subscribe-response").await["success"], true);

    for (level, message) in [
        ("warn", "unrelated"),
        ("error", "deprecated api"),
        ("warn", "deprecated api"),
    ] {
        send_json(
            &mut page,
            json!({"type": "console-log", "level": level, "message": message}),
        )
        .await;
    }

    let event = read_type(&mut agent, "log-event").await;
    assert_eq!(event["subscriptionId"], "warns");
    assert_eq!(event["data"]["level"], "warn");
    assert_eq!(event["data"]["message"], "deprecated api");

    handle.shutdown().await;
}

#[tokio::test]
async fn channel_publish_reaches_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let (mut listener, _) = connect(&handle).await;
    let (mut publisher, _) = connect(&handle).await;

    send_json(
        &mut listener,
        json!({"type": "subscribe", "requestId": "c", "channel": "lifecycle"}),
    )
    .await;
    let _ = read_type(&mut listener, "subscribe-response").await;

    send_json(
        &mut publisher,
        json!({"type": "publish", "channel": "lifecycle", "data": {"phase": "ready"}}),
    )
    .await;

    let event = read_type(&mut listener, "channel-event").await;
    assert_eq!(event["channel"], "lifecycle");
    assert_eq!(event["data"]["phase"], "ready");

    handle.shutdown().await;
}

#[tokio::test]
async fn health_reports_browser_presence() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let url = format!("http://{}/health", handle.addr());

    let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["browserConnected"], false);

    let _page = browser(&handle).await;
    let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["browserConnected"], true);
    assert!(body["connections"].as_u64().unwrap() >= 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_answers_in_flight_requests() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let mut page = browser(&handle).await;
    let (mut agent, _) = connect(&handle).await;

    send_json(&mut agent, json!({"type": "network", "requestId": "r-6"})).await;
    let _ = read_type(&mut page, "network").await;
    handle.shutdown().await;

    // The `bridge-closed` reply races the socket teardown.
    loop {
        match timeout(TIMEOUT, agent.next()).await.expect("socket never closed") {
            Some(Ok(Message::Text(text))) => {
                let reply: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(reply["requestId"], "r-6");
                assert_eq!(reply["error"], "bridge-closed");
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => break,
        }
    }
}

#[tokio::test]
async fn displaced_browser_is_told_before_close() {
    let dir = tempfile::tempdir().unwrap();
    let handle = boot(&dir, 10_000).await;
    let mut old = browser(&handle).await;
    let _new = browser(&handle).await;

    let notice = read_type(&mut old, "browser-replaced").await;
    assert!(notice["data"]["by"].as_str().unwrap().starts_with("conn_"));
    loop {
        match timeout(TIMEOUT, old.next()).await.expect("socket never closed") {
            Some(Ok(Message::Close(_)) | Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }
    assert!(handle.router().browser_connected());

    handle.shutdown().await;
}
