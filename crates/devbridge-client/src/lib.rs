//! # devbridge-client
//!
//! What a CLI or agent uses to talk to the bridge: connect, send a command,
//! wait for its correlated reply, and follow log streams.

#![deny(unsafe_code)]

pub mod client;
pub mod error;

pub use client::{AgentClient, CONNECT_TIMEOUT, LogFollow, REPLY_GRACE};
pub use error::ClientError;
