//! Runs agent commands against the page and builds the reply.
//!
//! Each forwarded envelope is handled on its own task so a slow capture does
//! not hold up the socket, and so a panicking collaborator turns into a
//! failure reply instead of taking the session down.

use std::sync::Arc;

use devbridge_core::commands::{
    ClickRequest, ExecJsRequest, GetLogsRequest, NetworkRequest, QueryDomRequest, RefreshRequest,
    ScreenshotRequest,
};
use devbridge_core::{CommandKind, Envelope, RequestKind, SaveKind};
use devbridge_settings::ExecSettings;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::collaborators::{CaptureOptions, CaptureTarget, Collaborators};
use crate::error::BrowserError;
use crate::log_buffer::LogBuffer;

/// Executes request-style and `save-*` envelopes.
#[derive(Debug)]
pub struct CommandExecutor {
    collaborators: Collaborators,
    logs: Arc<LogBuffer>,
    exec: ExecSettings,
}

impl CommandExecutor {
    /// Executor over the given page collaborators.
    pub fn new(collaborators: Collaborators, logs: Arc<LogBuffer>, exec: ExecSettings) -> Self {
        Self {
            collaborators,
            logs,
            exec,
        }
    }

    /// The log buffer `get-logs` and `save-logs` read from.
    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    /// Whether this executor answers `envelope` at all.
    pub fn accepts(envelope: &Envelope) -> bool {
        matches!(
            CommandKind::classify(envelope.kind()),
            Some(CommandKind::Request(_) | CommandKind::Save(_))
        )
    }

    /// Handle `envelope` on a new task and queue the reply on `out`.
    pub fn dispatch(self: &Arc<Self>, envelope: Envelope, out: mpsc::Sender<String>) {
        let executor = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let inner = Arc::clone(&executor);
            let request = envelope.clone();
            let reply = match tokio::spawn(async move { inner.execute(&request).await }).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(envelope_type = envelope.kind(), error = %e, "command handler aborted");
                    failure_reply(&envelope, &BrowserError::Panicked)
                }
            };
            if out.send(reply.to_json()).await.is_err() {
                debug!(envelope_type = envelope.kind(), "session ended before reply was sent");
            }
        });
    }

    /// Execute `envelope` and build the envelope to send back.
    ///
    /// Requests reply with `<type>-response`. A `save-<kind>` is answered by
    /// sending `save-<kind>` back with the artifact, or `<kind>-error`.
    #[instrument(
        skip_all,
        fields(envelope_type = envelope.kind(), request_id = ?envelope.request_id())
    )]
    pub async fn execute(&self, envelope: &Envelope) -> Envelope {
        let request_id = envelope.request_id();
        match CommandKind::classify(envelope.kind()) {
            Some(CommandKind::Request(kind)) => {
                let result = self.run(kind, envelope).await.map_err(|e| e.to_string());
                Envelope::response(kind.response_type(), request_id, result)
            }
            Some(CommandKind::Save(kind)) => match self.artifact(kind).await {
                Ok(data) => save_envelope(kind, request_id, data),
                Err(e) => Envelope::failure(kind.error_type(), request_id, e.to_string()),
            },
            _ => failure_reply(envelope, &BrowserError::Unsupported(envelope.kind().to_owned())),
        }
    }

    /// Run one request-style command.
    pub async fn run(&self, kind: RequestKind, envelope: &Envelope) -> Result<Value, BrowserError> {
        let c = &self.collaborators;
        match kind {
            RequestKind::Screenshot | RequestKind::RequestScreenshot => {
                let request: ScreenshotRequest = envelope.decode()?;
                let (target, options) = CaptureOptions::from_request(&request);
                self.screenshot(&target, &options).await
            }
            RequestKind::QueryDom => {
                let request: QueryDomRequest = envelope.decode()?;
                c.dom.query(&request.selector, request.all)
            }
            RequestKind::GetLogs => {
                let request: GetLogsRequest = envelope.decode()?;
                let logs = self.logs.snapshot(&request.filters, request.limit);
                Ok(json!({ "count": logs.len(), "logs": logs }))
            }
            RequestKind::ExecJs => {
                let request: ExecJsRequest = envelope.decode()?;
                self.check_exec(&request.code)?;
                let result = c.script.eval(&request.code).await?;
                Ok(json!({ "result": result }))
            }
            RequestKind::Click => {
                let request: ClickRequest = envelope.decode()?;
                c.page.click(&request.selector).await
            }
            RequestKind::Refresh => {
                let request: RefreshRequest = envelope.decode()?;
                c.page.refresh(request.hard).await?;
                Ok(json!({ "refreshed": true, "hard": request.hard }))
            }
            RequestKind::Network => {
                let request: NetworkRequest = envelope.decode()?;
                c.page.network_log(request.limit)
            }
            RequestKind::GetOutline => c.dom.outline(),
            RequestKind::GetSchema => c.dom.schema(),
            RequestKind::GetA11y => c.dom.a11y(),
        }
    }

    /// Produce the artifact a `save-<kind>` persists.
    pub async fn artifact(&self, kind: SaveKind) -> Result<Value, BrowserError> {
        let c = &self.collaborators;
        match kind {
            SaveKind::Screenshot => {
                self.screenshot(&CaptureTarget::Document, &CaptureOptions::default())
                    .await
            }
            SaveKind::Outline => c.dom.outline(),
            SaveKind::Schema => c.dom.schema(),
            SaveKind::A11y => c.dom.a11y(),
            SaveKind::Logs => serde_json::to_value(self.logs.partition())
                .map_err(|e| BrowserError::action("logs", e.to_string())),
            SaveKind::Network => c.page.network_log(None),
        }
    }

    async fn screenshot(
        &self,
        target: &CaptureTarget,
        options: &CaptureOptions,
    ) -> Result<Value, BrowserError> {
        let image = self.collaborators.renderer.capture(target, options).await?;
        Ok(json!({
            "screenshot": image.data_url(),
            "format": image.format,
            "width": image.width,
            "height": image.height,
        }))
    }

    fn check_exec(&self, code: &str) -> Result<(), BrowserError> {
        if !self.exec.enabled {
            return Err(BrowserError::ExecDisabled);
        }
        let len = code.chars().count();
        if len > self.exec.max_code_length {
            return Err(BrowserError::CodeTooLong {
                len,
                max: self.exec.max_code_length,
            });
        }
        Ok(())
    }
}

/// `save-<kind>` carrying `data`, sent from the page to the bridge.
pub fn save_envelope(kind: SaveKind, request_id: Option<&str>, data: Value) -> Envelope {
    let mut envelope = Envelope::new(kind.command_type()).with("data", data).stamped();
    if let Some(id) = request_id {
        envelope.set_request_id(id);
    }
    envelope
}

/// Failure reply of the type `envelope` expects back.
fn failure_reply(envelope: &Envelope, err: &BrowserError) -> Envelope {
    let request_id = envelope.request_id();
    let kind = match CommandKind::classify(envelope.kind()) {
        Some(CommandKind::Request(kind)) => kind.response_type().to_owned(),
        Some(CommandKind::Save(kind)) => kind.error_type(),
        _ => format!("{}-error", envelope.kind()),
    };
    Envelope::failure(kind, request_id, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        DomExtractor, Image, PageController, Renderer, ScriptEvaluator,
    };
    use async_trait::async_trait;
    use devbridge_core::commands::ImageFormat;
    use devbridge_core::{LogEntry, LogLevel};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePage {
        refreshed: AtomicBool,
    }

    #[async_trait]
    impl Renderer for FakePage {
        async fn capture(
            &self,
            target: &CaptureTarget,
            options: &CaptureOptions,
        ) -> Result<Image, BrowserError> {
            if let CaptureTarget::Element(selector) = target {
                if selector == "#missing" {
                    return Err(BrowserError::ElementNotFound {
                        selector: selector.clone(),
                    });
                }
            }
            Ok(Image {
                format: options.format,
                bytes: b"img".to_vec(),
                width: 800,
                height: 600,
            })
        }
    }

    impl DomExtractor for FakePage {
        fn outline(&self) -> Result<Value, BrowserError> {
            Ok(json!([{"level": 1, "text": "Home"}]))
        }
        fn schema(&self) -> Result<Value, BrowserError> {
            Ok(json!([]))
        }
        fn a11y(&self) -> Result<Value, BrowserError> {
            Err(BrowserError::action("a11y", "audit unavailable"))
        }
        fn query(&self, selector: &str, all: bool) -> Result<Value, BrowserError> {
            Ok(json!({"selector": selector, "all": all, "matches": 1}))
        }
    }

    #[async_trait]
    impl PageController for FakePage {
        async fn click(&self, selector: &str) -> Result<Value, BrowserError> {
            if selector == "#boom" {
                panic!("click handler exploded");
            }
            Ok(json!({"clicked": selector}))
        }
        async fn refresh(&self, _hard: bool) -> Result<(), BrowserError> {
            self.refreshed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn network_log(&self, limit: Option<usize>) -> Result<Value, BrowserError> {
            Ok(json!({"entries": [], "limit": limit}))
        }
    }

    #[async_trait]
    impl ScriptEvaluator for FakePage {
        async fn eval(&self, code: &str) -> Result<Value, BrowserError> {
            if code.contains("throw") {
                return Err(BrowserError::Script("Error: nope".into()));
            }
            Ok(json!(code.len()))
        }
    }

    fn executor(exec_enabled: bool) -> (Arc<CommandExecutor>, Arc<FakePage>) {
        let page = Arc::new(FakePage {
            refreshed: AtomicBool::new(false),
        });
        let collaborators = Collaborators {
            renderer: page.clone(),
            dom: page.clone(),
            page: page.clone(),
            script: page.clone(),
        };
        let exec = ExecSettings {
            enabled: exec_enabled,
            max_code_length: 16,
        };
        let logs = Arc::new(LogBuffer::default());
        (
            Arc::new(CommandExecutor::new(collaborators, logs, exec)),
            page,
        )
    }

    fn env(text: &str) -> Envelope {
        Envelope::parse(text).unwrap()
    }

    #[tokio::test]
    async fn screenshot_reply_carries_data_url() {
        let (ex, _) = executor(false);
        let reply = ex
            .execute(&env(r#"{"type":"screenshot","requestId":"r1","format":"jpeg"}"#))
            .await;
        assert_eq!(reply.kind(), "screenshot-response");
        assert_eq!(reply.request_id(), Some("r1"));
        assert!(reply.is_success());
        let data = reply.data().unwrap();
        assert!(
            data["screenshot"]
                .as_str()
                .unwrap()
                .starts_with(&format!("data:{};base64,", ImageFormat::Jpeg.mime()))
        );
        assert_eq!(data["width"], 800);
    }

    #[tokio::test]
    async fn legacy_screenshot_alias_replies_with_screenshot_response() {
        let (ex, _) = executor(false);
        let reply = ex
            .execute(&env(r#"{"type":"request-screenshot","requestId":"r"}"#))
            .await;
        assert_eq!(reply.kind(), "screenshot-response");
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn collaborator_error_becomes_failure_reply() {
        let (ex, _) = executor(false);
        let reply = ex
            .execute(&env(r##"{"type":"screenshot","requestId":"r","selector":"#missing"}"##))
            .await;
        assert!(!reply.is_success());
        assert_eq!(reply.error(), Some("element not found: #missing"));
    }

    #[tokio::test]
    async fn missing_field_is_invalid_request() {
        let (ex, _) = executor(false);
        let reply = ex.execute(&env(r#"{"type":"query-dom","requestId":"q"}"#)).await;
        assert_eq!(reply.kind(), "query-dom-response");
        assert!(reply.error().unwrap().starts_with("invalid request: malformed-envelope"));
    }

    #[tokio::test]
    async fn exec_js_is_refused_when_disabled() {
        let (ex, _) = executor(false);
        let reply = ex
            .execute(&env(r#"{"type":"exec-js","requestId":"x","code":"1+1"}"#))
            .await;
        assert_eq!(reply.kind(), "exec-js-response");
        assert!(reply.error().unwrap().starts_with("exec-js is disabled"));
    }

    #[tokio::test]
    async fn exec_js_enforces_length_limit() {
        let (ex, _) = executor(true);
        let reply = ex
            .execute(&env(
                r#"{"type":"exec-js","requestId":"x","code":"01234567890123456789"}"#,
            ))
            .await;
        assert_eq!(reply.error(), Some("code too long: 20 characters (max 16)"));

        let reply = ex
            .execute(&env(r#"{"type":"exec-js","requestId":"y","code":"1+1"}"#))
            .await;
        assert!(reply.is_success());
        assert_eq!(reply.data().unwrap()["result"], 3);
    }

    #[tokio::test]
    async fn exec_js_script_error() {
        let (ex, _) = executor(true);
        let reply = ex
            .execute(&env(r#"{"type":"exec-js","requestId":"x","code":"throw 1"}"#))
            .await;
        assert_eq!(reply.error(), Some("script error: Error: nope"));
    }

    #[tokio::test]
    async fn get_logs_filters_buffer() {
        let (ex, _) = executor(false);
        ex.logs().push(LogEntry::new(LogLevel::Info, "ready"));
        ex.logs().push(LogEntry::new(LogLevel::Error, "boom"));
        let reply = ex
            .execute(&env(
                r#"{"type":"get-logs","requestId":"l","filters":{"levels":["error"]}}"#,
            ))
            .await;
        let data = reply.data().unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["logs"][0]["message"], "boom");
    }

    #[tokio::test]
    async fn refresh_and_network() {
        let (ex, page) = executor(false);
        let reply = ex.execute(&env(r#"{"type":"refresh","requestId":"f"}"#)).await;
        assert!(reply.is_success());
        assert!(page.refreshed.load(Ordering::SeqCst));

        let reply = ex
            .execute(&env(r#"{"type":"network","requestId":"n","limit":5}"#))
            .await;
        assert_eq!(reply.data().unwrap()["limit"], 5);
    }

    #[tokio::test]
    async fn extraction_commands() {
        let (ex, _) = executor(false);
        let outline = ex.execute(&env(r#"{"type":"get-outline","requestId":"o"}"#)).await;
        assert_eq!(outline.data().unwrap()[0]["text"], "Home");
        let a11y = ex.execute(&env(r#"{"type":"get-a11y","requestId":"a"}"#)).await;
        assert_eq!(a11y.kind(), "get-a11y-response");
        assert_eq!(a11y.error(), Some("a11y failed: audit unavailable"));
    }

    #[tokio::test]
    async fn save_request_answers_with_artifact() {
        let (ex, _) = executor(false);
        let reply = ex.execute(&env(r#"{"type":"save-outline","requestId":"s"}"#)).await;
        assert_eq!(reply.kind(), "save-outline");
        assert_eq!(reply.request_id(), Some("s"));
        assert_eq!(reply.data().unwrap()[0]["level"], 1);
    }

    #[tokio::test]
    async fn save_failure_is_kind_error() {
        let (ex, _) = executor(false);
        let reply = ex.execute(&env(r#"{"type":"save-a11y","requestId":"s"}"#)).await;
        assert_eq!(reply.kind(), "a11y-error");
        assert!(!reply.is_success());
    }

    #[tokio::test]
    async fn unsupported_type() {
        let (ex, _) = executor(false);
        assert!(!CommandExecutor::accepts(&env(r#"{"type":"ping"}"#)));
        let reply = ex.execute(&env(r#"{"type":"ping","requestId":"p"}"#)).await;
        assert_eq!(reply.kind(), "ping-error");
        assert_eq!(reply.error(), Some("unsupported command: ping"));
    }

    #[tokio::test]
    async fn dispatch_queues_reply() {
        let (ex, _) = executor(false);
        let (tx, mut rx) = mpsc::channel(4);
        ex.dispatch(env(r##"{"type":"click","requestId":"c","selector":"#ok"}"##), tx);
        let reply = Envelope::parse(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.kind(), "click-response");
        assert_eq!(reply.data().unwrap()["clicked"], "#ok");
    }

    #[tokio::test]
    async fn dispatch_turns_panic_into_failure() {
        let (ex, _) = executor(false);
        let (tx, mut rx) = mpsc::channel(4);
        ex.dispatch(env(r##"{"type":"click","requestId":"c","selector":"#boom"}"##), tx);
        let reply = Envelope::parse(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.kind(), "click-response");
        assert_eq!(reply.request_id(), Some("c"));
        assert_eq!(reply.error(), Some("command handler panicked"));
    }
}
