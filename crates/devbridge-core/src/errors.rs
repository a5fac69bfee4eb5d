//! Bridge error type.
//!
//! The `Display` form of every variant is exactly the string placed in a
//! failure response's `error` field, so routing code can write
//! `err.to_string()` without a separate mapping table.

use thiserror::Error;

/// Errors produced while routing envelopes.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The envelope's `type` is not part of the protocol.
    #[error("unknown-command")]
    UnknownCommand {
        /// The unrecognized `type`.
        kind: String,
    },

    /// The envelope is not a JSON object, lacks `type`, or lacks a field its
    /// type requires.
    #[error("malformed-envelope: {detail}")]
    Malformed {
        /// What was wrong.
        detail: String,
    },

    /// A request-style command arrived while no browser is connected.
    #[error("no-browser-connected")]
    NoBrowserConnected,

    /// The browser did not reply before the request timed out.
    #[error("timeout")]
    Timeout,

    /// A request with the same id is still awaiting its reply.
    #[error("duplicate-request-id")]
    DuplicateRequestId {
        /// The conflicting id.
        request_id: String,
    },

    /// The subscription id is already owned by another connection.
    #[error("duplicate-subscription")]
    DuplicateSubscription {
        /// The conflicting id.
        subscription_id: String,
    },

    /// No subscription matched.
    #[error("subscription-not-found")]
    SubscriptionNotFound,

    /// The browser went away while the request was in flight.
    #[error("browser-disconnected")]
    BrowserDisconnected,

    /// The requesting connection went away while its request was in flight.
    #[error("origin-disconnected")]
    OriginDisconnected,

    /// The browser connection may not issue request-style commands.
    #[error("browser-cannot-request")]
    BrowserCannotRequest,

    /// A reply-style envelope arrived from a connection that is not the
    /// browser.
    #[error("reply-from-non-browser")]
    ReplyFromNonBrowser,

    /// The target connection's outbound queue is full or closed.
    #[error("send-failed")]
    SendFailed,

    /// Persisting an artifact failed.
    #[error("persistence-failed: {0}")]
    Persistence(String),

    /// The router has been closed.
    #[error("bridge-closed")]
    Closed,
}

impl BridgeError {
    /// Shorthand for a [`BridgeError::Malformed`].
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::Malformed {
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code (the wire string without detail).
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCommand { .. } => "unknown-command",
            Self::Malformed { .. } => "malformed-envelope",
            Self::NoBrowserConnected => "no-browser-connected",
            Self::Timeout => "timeout",
            Self::DuplicateRequestId { .. } => "duplicate-request-id",
            Self::DuplicateSubscription { .. } => "duplicate-subscription",
            Self::SubscriptionNotFound => "subscription-not-found",
            Self::BrowserDisconnected => "browser-disconnected",
            Self::OriginDisconnected => "origin-disconnected",
            Self::BrowserCannotRequest => "browser-cannot-request",
            Self::ReplyFromNonBrowser => "reply-from-non-browser",
            Self::SendFailed => "send-failed",
            Self::Persistence(_) => "persistence-failed",
            Self::Closed => "bridge-closed",
        }
    }
}
