//! Browser-side error types.
//!
//! Every failure that happens while serving a command is turned into a
//! `{success:false, error}` reply with the `Display` form below; nothing
//! propagates past the executor.

use devbridge_core::BridgeError;
use thiserror::Error;

/// Errors from page collaborators and the browser-side runtime.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The renderer could not produce an image.
    #[error("capture failed: {0}")]
    CaptureFailed(String),

    /// No element matched the selector.
    #[error("element not found: {selector}")]
    ElementNotFound {
        /// The CSS selector that matched nothing.
        selector: String,
    },

    /// A page action or extraction failed.
    #[error("{action} failed: {reason}")]
    ActionFailed {
        /// The action that failed (e.g., "click", "outline").
        action: String,
        /// Why it failed.
        reason: String,
    },

    /// `exec-js` arrived while script evaluation is disabled.
    #[error("exec-js is disabled (set DEVBRIDGE_ALLOW_EXEC=1 to enable)")]
    ExecDisabled,

    /// Script longer than the configured limit.
    #[error("code too long: {len} characters (max {max})")]
    CodeTooLong {
        /// Length of the rejected script.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// The evaluated script threw.
    #[error("script error: {0}")]
    Script(String),

    /// The request could not be decoded.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The envelope type is not something the page executes.
    #[error("unsupported command: {0}")]
    Unsupported(String),

    /// The command handler panicked.
    #[error("command handler panicked")]
    Panicked,

    /// Socket-level failure talking to the bridge.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out.
    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout {
        /// How long we waited.
        timeout_ms: u64,
        /// What we were waiting for.
        context: String,
    },
}

impl BrowserError {
    /// Shorthand for [`BrowserError::ActionFailed`].
    pub fn action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ActionFailed {
            action: action.into(),
            reason: reason.into(),
        }
    }
}

impl From<BridgeError> for BrowserError {
    fn from(err: BridgeError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BrowserError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
