//! Settings types. Every section serializes as camelCase JSON and falls back
//! to its defaults field-by-field.

use devbridge_core::constants::{
    DEFAULT_BRIDGE_PORT, DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_RECONNECT_MAX_ATTEMPTS,
    DEFAULT_RECONNECT_MAX_DELAY_MS, DEFAULT_REQUEST_TIMEOUT_MS, WS_PATH, derive_bridge_port,
};
use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Forwarded request settings.
    pub requests: RequestSettings,
    /// Browser-side reconnect policy.
    pub reconnect: ReconnectSettings,
    /// Browser-side HMR capture.
    pub hmr: HmrSettings,
    /// Browser-side script evaluation gate.
    pub exec: ExecSettings,
    /// Artifact persistence.
    pub persistence: PersistenceSettings,
    /// Diagnostics.
    pub logging: LoggingSettings,
}

impl BridgeSettings {
    /// `ws://host:port/ws` for clients of this bridge.
    pub fn bridge_url(&self) -> String {
        let host = match self.server.host.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("ws://{host}:{}{WS_PATH}", self.server.effective_port())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bridge port used when `appPort` is not set.
    pub port: u16,
    /// Port of the dev server the bridge is attached to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_port: Option<u16>,
    /// Maximum concurrent sockets.
    pub max_connections: usize,
    /// Interval between server Ping frames, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Silence after which a socket is dropped, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted frame, in bytes.
    pub max_message_size: usize,
    /// Outbound queue depth per connection.
    pub send_queue: usize,
}

impl ServerSettings {
    /// `appPort + 6223` when attached to a dev server, `port` otherwise.
    pub fn effective_port(&self) -> u16 {
        self.app_port
            .and_then(derive_bridge_port)
            .unwrap_or(self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_BRIDGE_PORT,
            app_port: None,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_message_size: 32 * 1024 * 1024, // screenshots arrive base64-encoded
            send_queue: 256,
        }
    }
}

/// Forwarded request settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestSettings {
    /// How long the bridge waits for the browser's reply.
    pub timeout_ms: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Browser-side reconnect policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Delay after the first failure.
    pub base_delay_ms: u64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Consecutive failures before giving up.
    pub max_attempts: u32,
    /// How long to wait for `hello-response` after the socket opens.
    pub verify_timeout_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            verify_timeout_ms: 5_000,
        }
    }
}

/// Browser-side HMR capture.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HmrSettings {
    /// Capture after hot reloads at all.
    pub enabled: bool,
    /// Burst coalescing window.
    pub debounce_ms: u64,
    /// DOM settle time before each capture.
    pub capture_delay_ms: u64,
}

impl Default for HmrSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 1_000,
            capture_delay_ms: 500,
        }
    }
}

/// Gate for `exec-js`, which evaluates arbitrary code in the page.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecSettings {
    /// Off unless explicitly enabled.
    pub enabled: bool,
    /// Longest accepted script, in characters.
    pub max_code_length: usize,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_code_length: 10_000,
        }
    }
}

/// Artifact persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    /// Directory artifacts are written under (relative paths resolve against
    /// the bridge's working directory).
    pub output_dir: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            output_dir: ".devbridge/captures".to_string(),
        }
    }
}

/// Diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let s = BridgeSettings::default();
        assert_eq!(s.server.port, 9223);
        assert_eq!(s.requests.timeout_ms, 10_000);
        assert_eq!(s.reconnect.base_delay_ms, 1_000);
        assert_eq!(s.reconnect.max_delay_ms, 30_000);
        assert_eq!(s.reconnect.max_attempts, 10);
        assert!(!s.exec.enabled);
    }

    #[test]
    fn effective_port_without_app_port() {
        let server = ServerSettings::default();
        assert_eq!(server.effective_port(), 9223);
    }

    #[test]
    fn effective_port_derived_from_app_port() {
        let server = ServerSettings {
            app_port: Some(5173),
            ..ServerSettings::default()
        };
        assert_eq!(server.effective_port(), 5173 + 6223);
    }

    #[test]
    fn effective_port_falls_back_on_overflow() {
        let server = ServerSettings {
            app_port: Some(64_000),
            port: 9300,
            ..ServerSettings::default()
        };
        assert_eq!(server.effective_port(), 9300);
    }

    #[test]
    fn bridge_url_rewrites_wildcard_host() {
        let mut s = BridgeSettings::default();
        s.server.host = "0.0.0.0".into();
        assert_eq!(s.bridge_url(), "ws://127.0.0.1:9223/ws");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: BridgeSettings =
            serde_json::from_str(r#"{"server":{"port":9400},"exec":{"enabled":true}}"#).unwrap();
        assert_eq!(s.server.port, 9400);
        assert_eq!(s.server.host, "127.0.0.1");
        assert!(s.exec.enabled);
        assert_eq!(s.exec.max_code_length, 10_000);
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(BridgeSettings::default()).unwrap();
        assert!(value["server"]["maxConnections"].is_u64());
        assert!(value["hmr"]["captureDelayMs"].is_u64());
        assert!(value["server"].get("appPort").is_none());
    }
}
