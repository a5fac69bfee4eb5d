//! `/health` endpoint.

use std::time::Instant;

use devbridge_core::constants::VERSION;
use serde::Serialize;

use crate::router::RouterStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Whether a browser is attached.
    pub browser_connected: bool,
    /// Requests awaiting a browser reply.
    pub pending_requests: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, stats: &RouterStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        version: VERSION.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.connections,
        browser_connected: stats.browser_connected,
        pending_requests: stats.pending_requests,
    }
}
