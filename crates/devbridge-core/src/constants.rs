//! Package-level constants and protocol defaults.

/// Current version (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "devbridge";

/// Bridge port used when no dev server port is known.
pub const DEFAULT_BRIDGE_PORT: u16 = 9223;

/// Offset added to a dev server's port to derive the bridge port.
pub const APP_PORT_OFFSET: u16 = 6223;

/// How long a forwarded request waits for the browser's reply.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// First reconnect delay.
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound for any reconnect delay.
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Consecutive failures after which the browser side stops retrying.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Channel on which the bridge announces browser connect/disconnect.
pub const LIFECYCLE_CHANNEL: &str = "lifecycle";

/// Channel on which HMR captures are fanned out.
pub const HMR_CHANNEL: &str = "hmr";

/// WebSocket endpoint path.
pub const WS_PATH: &str = "/ws";

/// Frame sent to a browser right before the bridge closes it in favour of a
/// newer one.
pub const BROWSER_REPLACED: &str = "browser-replaced";

/// `client` identifier reported in `hello`, e.g. `devbridge-browser/0.1.0`.
pub fn client_name(component: &str) -> String {
    format!("{NAME}-{component}/{VERSION}")
}

/// Derive the bridge port for a dev server listening on `app_port`.
///
/// Returns `None` when the sum does not fit in a port number.
pub fn derive_bridge_port(app_port: u16) -> Option<u16> {
    app_port.checked_add(APP_PORT_OFFSET)
}
