//! The page's connection to the bridge.
//!
//! [`BrowserHandle::spawn`] starts a task that connects, announces itself
//! with `hello role:browser`, waits for `hello-response`, executes forwarded
//! commands, and reconnects with backoff when the socket is lost.

use std::sync::Arc;

use devbridge_core::constants::{BROWSER_REPLACED, client_name};
use devbridge_core::{Envelope, LogEntry, RequestId, Role, SaveKind};
use devbridge_settings::{BridgeSettings, ExecSettings, HmrSettings};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::Collaborators;
use crate::error::BrowserError;
use crate::executor::{CommandExecutor, save_envelope};
use crate::hmr::HmrCapturer;
use crate::log_buffer::{DEFAULT_LOG_CAPACITY, LogBuffer};
use crate::outbox::Outbox;
use crate::reconnect::{ConnectionState, ReconnectController, ReconnectPolicy, RetryDecision};

/// Outbound queue depth per session.
const OUTBOUND_QUEUE: usize = 256;

/// How long `shutdown` waits for the run loop to close the socket.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Browser-side runtime configuration.
#[derive(Clone, Debug)]
pub struct BrowserConfig {
    /// `ws://` URL of the bridge.
    pub url: String,
    /// URL of the page, reported in `hello`.
    pub page_url: Option<String>,
    /// Reconnect backoff.
    pub policy: ReconnectPolicy,
    /// HMR capture.
    pub hmr: HmrSettings,
    /// `exec-js` gate.
    pub exec: ExecSettings,
    /// Console entries retained for `get-logs`.
    pub log_capacity: usize,
}

impl BrowserConfig {
    /// Configuration derived from loaded settings.
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            url: settings.bridge_url(),
            page_url: None,
            policy: ReconnectPolicy::from_settings(&settings.reconnect),
            hmr: settings.hmr.clone(),
            exec: settings.exec.clone(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Same configuration, different bridge URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self::from_settings(&BridgeSettings::default())
    }
}

#[derive(Debug)]
enum Control {
    Reconnect,
    Shutdown,
}

/// Handle to a running browser-side client.
///
/// Dropping the handle stops the client as well; [`BrowserHandle::shutdown`]
/// additionally waits for the socket to close.
#[derive(Debug)]
pub struct BrowserHandle {
    control_tx: mpsc::UnboundedSender<Control>,
    state_rx: watch::Receiver<ConnectionState>,
    logs: Arc<LogBuffer>,
    outbox: Arc<Outbox>,
    executor: Arc<CommandExecutor>,
    hmr: HmrCapturer,
    task: JoinHandle<()>,
}

impl BrowserHandle {
    /// Start connecting in the background.
    pub fn spawn(config: BrowserConfig, collaborators: Collaborators) -> Self {
        let logs = Arc::new(LogBuffer::new(config.log_capacity));
        let outbox = Arc::new(Outbox::new());
        let hmr = HmrCapturer::spawn(
            &config.hmr,
            Arc::clone(&collaborators.renderer),
            Arc::clone(&logs),
            Arc::clone(&outbox),
        );
        let executor = Arc::new(CommandExecutor::new(
            collaborators,
            Arc::clone(&logs),
            config.exec.clone(),
        ));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let runner = Runner {
            controller: ReconnectController::new(config.policy.clone()),
            config,
            control_rx,
            state_tx,
            outbox: Arc::clone(&outbox),
            executor: Arc::clone(&executor),
        };
        let task = tokio::spawn(runner.run());

        Self {
            control_tx,
            state_rx,
            logs,
            outbox,
            executor,
            hmr,
            task,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the state satisfies `predicate`. Returns the matching
    /// state, or [`ConnectionState::Closed`] if the client stopped first.
    pub async fn wait_for(&self, predicate: impl Fn(ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.state_rx.clone();
        match rx.wait_for(|state| predicate(*state)).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Closed,
        }
    }

    /// Buffer a console entry and push it to subscribers.
    pub fn log(&self, mut entry: LogEntry) {
        if entry.timestamp.is_none() {
            entry.timestamp = Some(chrono::Utc::now().timestamp_millis());
        }
        let envelope = console_envelope(&entry);
        self.logs.push(entry);
        let _ = self.outbox.push(&envelope);
    }

    /// Report a hot reload.
    pub fn trigger_hmr(&self) {
        self.hmr.trigger();
    }

    /// Toolbar-initiated save: build the artifact and ask the bridge to
    /// persist it. Returns `false` when the bridge is unreachable.
    pub async fn save(&self, kind: SaveKind) -> Result<bool, BrowserError> {
        let data = self.executor.artifact(kind).await?;
        let request_id = RequestId::new();
        let envelope = save_envelope(kind, Some(request_id.as_str()), data);
        Ok(self.outbox.push(&envelope))
    }

    /// Publish `data` on `channel`.
    pub fn publish(&self, channel: &str, data: Value) -> bool {
        let envelope = Envelope::new("publish")
            .with("channel", Value::String(channel.to_owned()))
            .with("data", data);
        self.outbox.push(&envelope)
    }

    /// Drop the current socket (or leave `GaveUp` or `Replaced`) and connect
    /// again with a fresh attempt counter.
    pub fn reconnect(&self) {
        let _ = self.control_tx.send(Control::Reconnect);
    }

    /// The console buffer.
    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    /// Stop reconnecting, close the socket, and wait for the run loop.
    pub async fn shutdown(self) {
        let _ = self.control_tx.send(Control::Shutdown);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task).await.is_err() {
            abort.abort();
        }
    }
}

fn console_envelope(entry: &LogEntry) -> Envelope {
    let mut envelope = Envelope::new("console-log");
    if let Ok(Value::Object(fields)) = serde_json::to_value(entry) {
        for (key, value) in fields {
            envelope = envelope.with(&key, value);
        }
    }
    envelope
}

enum SessionEnd {
    Lost(String),
    Replaced,
    Reconnect,
    Shutdown,
}

fn control_end(control: Option<Control>) -> SessionEnd {
    match control {
        Some(Control::Reconnect) => SessionEnd::Reconnect,
        Some(Control::Shutdown) | None => SessionEnd::Shutdown,
    }
}

struct Runner {
    config: BrowserConfig,
    controller: ReconnectController,
    control_rx: mpsc::UnboundedReceiver<Control>,
    state_tx: watch::Sender<ConnectionState>,
    outbox: Arc<Outbox>,
    executor: Arc<CommandExecutor>,
}

impl Runner {
    #[instrument(skip_all, fields(url = %self.config.url))]
    async fn run(mut self) {
        loop {
            self.controller.on_connecting();
            self.publish_state();

            let end = self.session().await;
            self.outbox.detach();

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Reconnect => {
                    info!("manual reconnect");
                    let _ = self.controller.manual_reconnect();
                }
                SessionEnd::Replaced => {
                    warn!("another page took over the bridge, waiting for manual reconnect");
                    self.controller.on_replaced();
                    self.publish_state();
                    if !self.wait_for_retry().await {
                        break;
                    }
                }
                SessionEnd::Lost(reason) => {
                    match self.controller.on_failure(Instant::now()) {
                        RetryDecision::Retry(delay) => warn!(
                            %reason,
                            attempt = self.controller.attempt(),
                            ?delay,
                            "bridge connection failed, retrying"
                        ),
                        RetryDecision::GaveUp => warn!(
                            %reason,
                            attempts = self.controller.attempt(),
                            "bridge unreachable, giving up until manual reconnect"
                        ),
                    }
                    self.publish_state();
                    if !self.wait_for_retry().await {
                        break;
                    }
                }
            }
        }

        self.controller.teardown();
        self.publish_state();
        debug!("browser client stopped");
    }

    /// Sleep until the retry deadline, or until a manual reconnect when no
    /// retry is scheduled. Returns `false` on shutdown.
    async fn wait_for_retry(&mut self) -> bool {
        let retry_at = self.controller.retry_at();
        let deadline = retry_at.unwrap_or_else(Instant::now);
        tokio::select! {
            () = tokio::time::sleep_until(deadline), if retry_at.is_some() => true,
            control = self.control_rx.recv() => match control_end(control) {
                SessionEnd::Reconnect => {
                    let _ = self.controller.manual_reconnect();
                    true
                }
                SessionEnd::Shutdown | SessionEnd::Lost(_) | SessionEnd::Replaced => false,
            },
        }
    }

    async fn session(&mut self) -> SessionEnd {
        let verify_timeout = self.controller.policy().verify_timeout;
        let timeout_ms = verify_timeout.as_millis() as u64;

        let connect = connect_async(self.config.url.as_str());
        let connected = tokio::select! {
            res = tokio::time::timeout(verify_timeout, connect) => res,
            control = self.control_rx.recv() => return control_end(control),
        };
        let ws = match connected {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return SessionEnd::Lost(BrowserError::from(e).to_string()),
            Err(_) => {
                let err = BrowserError::Timeout {
                    timeout_ms,
                    context: "connect".into(),
                };
                return SessionEnd::Lost(err.to_string());
            }
        };
        self.controller.on_open();
        self.publish_state();

        let (mut ws_tx, mut ws_rx) = ws.split();
        if let Err(e) = ws_tx.send(Message::Text(self.hello().to_json().into())).await {
            return SessionEnd::Lost(BrowserError::from(e).to_string());
        }

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        self.outbox.attach(out_tx.clone());
        let verify = tokio::time::sleep(verify_timeout);
        tokio::pin!(verify);

        loop {
            tokio::select! {
                control = self.control_rx.recv() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return control_end(control);
                }
                () = &mut verify, if !self.controller.state().is_verified() => {
                    let err = BrowserError::Timeout {
                        timeout_ms,
                        context: "hello-response".into(),
                    };
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return SessionEnd::Lost(err.to_string());
                }
                Some(text) = out_rx.recv() => {
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        return SessionEnd::Lost(BrowserError::from(e).to_string());
                    }
                }
                msg = ws_rx.next() => match msg {
                    None => return SessionEnd::Lost("connection closed".into()),
                    Some(Err(e)) => return SessionEnd::Lost(BrowserError::from(e).to_string()),
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.on_text(text.as_str(), &out_tx) {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return SessionEnd::Lost("closed by bridge".into());
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Handle one frame from the bridge. Returns `Some` when the frame ends
    /// the session.
    fn on_text(&mut self, text: &str, out: &mpsc::Sender<String>) -> Option<SessionEnd> {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable frame from bridge");
                return None;
            }
        };
        let kind = envelope.kind().to_owned();
        match kind.as_str() {
            "hello-response" if envelope.is_success() => {
                self.controller.on_verified();
                self.publish_state();
                info!("connected to bridge");
            }
            "hello-response" => {
                warn!(error = ?envelope.error(), "bridge rejected hello");
            }
            "connection-established" => {
                debug!(data = ?envelope.data(), "socket accepted");
            }
            BROWSER_REPLACED => {
                info!(data = ?envelope.data(), "replaced by another browser");
                return Some(SessionEnd::Replaced);
            }
            _ if CommandExecutor::accepts(&envelope) => {
                debug!(
                    envelope_type = %kind,
                    request_id = ?envelope.request_id(),
                    "executing command"
                );
                self.executor.dispatch(envelope, out.clone());
            }
            _ => {
                debug!(envelope_type = %kind, "ignoring frame");
            }
        }
        None
    }

    fn hello(&self) -> Envelope {
        let mut hello = Envelope::new("hello")
            .with("role", Value::String(Role::Browser.as_str().to_owned()))
            .with(
                "client",
                Value::String(client_name("browser")),
            );
        if let Some(url) = &self.config.page_url {
            hello = hello.with("url", Value::String(url.clone()));
        }
        hello
    }

    fn publish_state(&self) {
        let _ = self.state_tx.send_replace(self.controller.state());
    }
}
