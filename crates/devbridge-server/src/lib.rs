//! # devbridge-server
//!
//! The bridge process: an Axum WebSocket endpoint that multiplexes one
//! browser connection and any number of agent connections.
//!
//! - **Connections**: per-socket send queue, role, liveness
//! - **Registry**: live sockets and the authoritative browser slot
//! - **Pending**: request correlation with per-entry expiry timers
//! - **Subscriptions**: log-stream filters and channel fan-out
//! - **Router**: dispatch of every inbound envelope
//! - **Persistence**: `save-*` artifacts on disk
//! - **Server**: `/ws` and `/health`, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod health;
pub mod pending;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod subscriptions;

pub use config::ServerConfig;
pub use persistence::{ArtifactStore, FsArtifactStore, PersistError};
pub use router::{Router, RouterStats};
pub use server::{BridgeServer, ServerHandle};
