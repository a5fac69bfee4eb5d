//! Agent client errors.

use std::time::Duration;

use thiserror::Error;

/// Errors from talking to the bridge as an agent.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The bridge could not be reached.
    #[error("cannot connect to bridge at {url}: {reason}")]
    Connect {
        /// Bridge URL.
        url: String,
        /// Why the connection failed.
        reason: String,
    },

    /// The socket failed mid-session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection closed before the reply arrived.
    #[error("connection to bridge closed")]
    Closed,

    /// No reply within the wait limit.
    #[error("no reply within {}s", .waited.as_secs())]
    Timeout {
        /// How long we waited.
        waited: Duration,
    },

    /// The bridge or browser answered with `success:false`.
    #[error("{error}")]
    Remote {
        /// Reply `type`.
        kind: String,
        /// The reply's `error` string.
        error: String,
    },
}

impl ClientError {
    /// Whether the failure means no browser is attached.
    pub fn is_no_browser(&self) -> bool {
        matches!(self, Self::Remote { error, .. } if error == "no-browser-connected")
    }

    /// Whether the failure means the browser never answered, either because
    /// the bridge's timer fired or because our own wait ran out.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Remote { error, .. } => error == "timeout",
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
