//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use devbridge_core::constants::DEFAULT_REQUEST_TIMEOUT_MS;
use devbridge_settings::BridgeSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the bridge server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server Ping frames, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Silence after which a socket is dropped, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound queue depth per connection.
    pub send_queue: usize,
    /// How long a forwarded request waits for the browser.
    pub request_timeout_ms: u64,
    /// Where `save-*` artifacts are written.
    pub output_dir: PathBuf,
}

impl ServerConfig {
    /// Derive from loaded settings. The port is the effective one
    /// (`appPort + 6223` when attached to a dev server).
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.effective_port(),
            max_connections: server.max_connections,
            heartbeat_interval_secs: server.heartbeat_interval_secs,
            heartbeat_timeout_secs: server.heartbeat_timeout_secs,
            max_message_size: server.max_message_size,
            send_queue: server.send_queue,
            request_timeout_ms: settings.requests.timeout_ms,
            output_dir: PathBuf::from(&settings.persistence.output_dir),
        }
    }

    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Ping interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Silence limit as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_message_size: 32 * 1024 * 1024,
            send_queue: 256,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            output_dir: PathBuf::from(".devbridge/captures"),
        }
    }
}
