//! # devbridge-browser
//!
//! The page side of the bridge. Rendering and DOM access are delegated to
//! [`collaborators`]; this crate owns everything around them:
//!
//! - **Client**: connect, verify with `hello`, reconnect with bounded backoff
//! - **Executor**: run forwarded commands and build their replies
//! - **HMR**: debounce hot-reload bursts into sequenced captures
//! - **Log buffer**: recent console entries for `get-logs` and captures

#![deny(unsafe_code)]

pub mod client;
pub mod collaborators;
pub mod error;
pub mod executor;
pub mod hmr;
pub mod log_buffer;
pub mod outbox;
pub mod reconnect;

pub use client::{BrowserConfig, BrowserHandle};
pub use collaborators::{
    CaptureOptions, CaptureTarget, Collaborators, DomExtractor, Image, PageController, Renderer,
    ScriptEvaluator,
};
pub use error::BrowserError;
pub use executor::CommandExecutor;
pub use hmr::{DebounceState, HmrCapturer};
pub use log_buffer::{LogBuffer, LogPartition};
pub use reconnect::{ConnectionState, ReconnectController, ReconnectPolicy, RetryDecision};
