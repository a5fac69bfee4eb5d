//! # devbridge-core
//!
//! Shared vocabulary for the bridge process, the browser-side runtime, and
//! the agent client:
//!
//! - **Branded IDs**: `ConnectionId`, `RequestId`, `SubscriptionId`
//! - **Envelopes**: the JSON frame unit exchanged over the socket, keyed by `type`
//! - **Commands**: classification of envelope types and their typed payloads
//! - **Logs**: console log entries and subscription filters
//! - **Errors**: `BridgeError`, whose `Display` is the wire `error` string
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod commands;
pub mod constants;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod logs;

pub use commands::{CommandKind, RequestKind, SaveKind};
pub use envelope::{Envelope, Role};
pub use errors::BridgeError;
pub use ids::{ConnectionId, RequestId, SubscriptionId};
pub use logs::{LogEntry, LogFilter, LogLevel};
