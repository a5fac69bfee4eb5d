//! Envelope classification and typed payloads.
//!
//! The router classifies every incoming envelope with [`CommandKind::classify`]
//! and then decodes only the payload its category needs. Request-style
//! commands are forwarded verbatim, so their payload types are used for
//! validation on the bridge and for execution on the browser side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{Role, is_reply_type};
use crate::logs::LogFilter;

/// Commands the browser executes on behalf of an agent, each expecting one reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Capture the page or an element.
    Screenshot,
    /// Alias of `screenshot` kept for older toolbars.
    RequestScreenshot,
    /// Run a CSS selector against the DOM.
    QueryDom,
    /// Snapshot of buffered console logs.
    GetLogs,
    /// Evaluate a script in the page (debug-only escape hatch).
    ExecJs,
    /// Click the first element matching a selector.
    Click,
    /// Reload the page.
    Refresh,
    /// Recent network activity.
    Network,
    /// Document outline (headings / landmarks).
    GetOutline,
    /// Structured data found in the page.
    GetSchema,
    /// Accessibility audit.
    GetA11y,
}

impl RequestKind {
    /// Every request kind.
    pub const ALL: [Self; 11] = [
        Self::Screenshot,
        Self::RequestScreenshot,
        Self::QueryDom,
        Self::GetLogs,
        Self::ExecJs,
        Self::Click,
        Self::Refresh,
        Self::Network,
        Self::GetOutline,
        Self::GetSchema,
        Self::GetA11y,
    ];

    /// Envelope `type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::RequestScreenshot => "request-screenshot",
            Self::QueryDom => "query-dom",
            Self::GetLogs => "get-logs",
            Self::ExecJs => "exec-js",
            Self::Click => "click",
            Self::Refresh => "refresh",
            Self::Network => "network",
            Self::GetOutline => "get-outline",
            Self::GetSchema => "get-schema",
            Self::GetA11y => "get-a11y",
        }
    }

    /// Envelope `type` of the reply.
    pub fn response_type(self) -> &'static str {
        match self {
            Self::Screenshot | Self::RequestScreenshot => "screenshot-response",
            Self::QueryDom => "query-dom-response",
            Self::GetLogs => "get-logs-response",
            Self::ExecJs => "exec-js-response",
            Self::Click => "click-response",
            Self::Refresh => "refresh-response",
            Self::Network => "network-response",
            Self::GetOutline => "get-outline-response",
            Self::GetSchema => "get-schema-response",
            Self::GetA11y => "get-a11y-response",
        }
    }

    fn from_type(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

/// Artifacts that `save-<kind>` persists to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveKind {
    /// Page or element image.
    Screenshot,
    /// Document outline.
    Outline,
    /// Structured data.
    Schema,
    /// Accessibility audit.
    A11y,
    /// Console log snapshot.
    Logs,
    /// Network activity snapshot.
    Network,
}

impl SaveKind {
    /// Every save kind.
    pub const ALL: [Self; 6] = [
        Self::Screenshot,
        Self::Outline,
        Self::Schema,
        Self::A11y,
        Self::Logs,
        Self::Network,
    ];

    /// Short name used in envelope types and file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::Outline => "outline",
            Self::Schema => "schema",
            Self::A11y => "a11y",
            Self::Logs => "logs",
            Self::Network => "network",
        }
    }

    /// `save-<kind>`.
    pub fn command_type(self) -> String {
        format!("save-{}", self.as_str())
    }

    /// `<kind>-saved`.
    pub fn saved_type(self) -> String {
        format!("{}-saved", self.as_str())
    }

    /// `<kind>-error`.
    pub fn error_type(self) -> String {
        format!("{}-error", self.as_str())
    }

    fn from_command(kind: &str) -> Option<Self> {
        let name = kind.strip_prefix("save-")?;
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

/// How the router treats an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Role handshake; answered by the router.
    Hello,
    /// Liveness check; answered by the router.
    Ping,
    /// Bridge status; answered by the router.
    Status,
    /// Active subscriptions; answered by the router.
    ListSubscriptions,
    /// Forwarded to the browser with a pending request.
    Request(RequestKind),
    /// Artifact persistence (forwarded from agents, persisted from the browser).
    Save(SaveKind),
    /// Create a log-stream subscription.
    LogSubscribe,
    /// Remove a log-stream subscription.
    LogUnsubscribe,
    /// Join a channel.
    Subscribe,
    /// Leave a channel.
    Unsubscribe,
    /// Browser push: one console line.
    ConsoleLog,
    /// Browser push: one HMR capture.
    HmrScreenshot,
    /// Push an arbitrary payload to a channel.
    Publish,
    /// Browser reply to a forwarded request.
    Reply,
}

impl CommandKind {
    /// Classify an envelope `type`. `None` means unknown.
    pub fn classify(kind: &str) -> Option<Self> {
        let command = match kind {
            "hello" => Self::Hello,
            "ping" => Self::Ping,
            "status" => Self::Status,
            "list-subscriptions" => Self::ListSubscriptions,
            "log-subscribe" => Self::LogSubscribe,
            "log-unsubscribe" => Self::LogUnsubscribe,
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "console-log" => Self::ConsoleLog,
            "hmr-screenshot" => Self::HmrScreenshot,
            "publish" => Self::Publish,
            other => {
                if let Some(request) = RequestKind::from_type(other) {
                    Self::Request(request)
                } else if let Some(save) = SaveKind::from_command(other) {
                    Self::Save(save)
                } else if is_reply_type(other) {
                    Self::Reply
                } else {
                    return None;
                }
            }
        };
        Some(command)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// `hello`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Role the connection claims.
    pub role: Role,
    /// Page URL (browser only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Free-form client description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

/// `log-subscribe`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSubscribe {
    /// Caller-chosen key.
    pub subscription_id: String,
    /// Delivery filter.
    #[serde(default)]
    pub filters: LogFilter,
}

/// `log-unsubscribe`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogUnsubscribe {
    /// Key given at subscribe time.
    pub subscription_id: String,
}

/// `subscribe` / `unsubscribe`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelRequest {
    /// Channel name.
    pub channel: String,
}

/// `publish`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Publish {
    /// Target channel.
    pub channel: String,
    /// Payload delivered verbatim.
    #[serde(default)]
    pub data: Value,
}

/// `hmr-screenshot`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmrScreenshot {
    /// Capture ordering key.
    pub sequence: u64,
    /// Screenshot and log snapshot.
    #[serde(default)]
    pub data: Value,
}

/// Image encodings the renderer can produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Lossless.
    #[default]
    Png,
    /// Lossy.
    #[serde(alias = "jpg")]
    Jpeg,
    /// Lossy, smaller.
    Webp,
}

impl ImageFormat {
    /// File extension.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }

    /// MIME type.
    pub fn mime(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}

/// `screenshot` / `request-screenshot` / `save-screenshot`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRequest {
    /// Element to capture; the whole document when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Device pixel scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    /// Output encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    /// Lossy quality 0..=1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
}

/// `query-dom`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDomRequest {
    /// CSS selector.
    pub selector: String,
    /// Return every match instead of the first.
    #[serde(default)]
    pub all: bool,
}

/// `get-logs`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLogsRequest {
    /// Filter applied to the buffer.
    #[serde(default)]
    pub filters: LogFilter,
    /// Keep only the newest `limit` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// `exec-js`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecJsRequest {
    /// Script source.
    pub code: String,
}

/// `click`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClickRequest {
    /// CSS selector of the element to click.
    pub selector: String,
}

/// `refresh`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// Bypass caches.
    #[serde(default)]
    pub hard: bool,
}

/// `network`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkRequest {
    /// Keep only the newest `limit` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// `save-<kind>` sent by the browser with the artifact to persist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavePayload {
    /// Artifact content.
    pub data: Value,
}
