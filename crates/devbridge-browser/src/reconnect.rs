//! Reconnection state machine.
//!
//! Pure bookkeeping: the client loop reports what happened to the socket and
//! asks the controller what to do next. The pending retry is a deadline owned
//! by the controller, so clearing it on teardown is all it takes to cancel.
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Connected{verified:false} ─▶ Connected{verified:true}
//!      ▲              │                   │                          │
//!      └── failure ◀──┴───────────────────┴──────────────────────────┘
//!                     └── 10th consecutive failure ─▶ GaveUp ── manual_reconnect ─▶ Disconnected
//! Connected ── browser-replaced ─▶ Replaced ── manual_reconnect ─▶ Disconnected
//! ```

use std::time::Duration;

use devbridge_settings::ReconnectSettings;
use tokio::time::Instant;

/// Backoff parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap on any delay.
    pub max_delay: Duration,
    /// Consecutive failures that end in [`ConnectionState::GaveUp`].
    pub max_attempts: u32,
    /// How long a fresh socket has to produce `hello-response`.
    pub verify_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

impl ReconnectPolicy {
    /// Policy from the `reconnect` settings section.
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts.max(1),
            verify_timeout: Duration::from_millis(settings.verify_timeout_ms),
        }
    }

    /// Delay before retrying after the `failure`-th consecutive failure
    /// (1-based): `min(base * 2^(failure-1), max)`.
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Where the browser side stands with the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; a retry may be scheduled.
    Disconnected,
    /// Socket being opened.
    Connecting,
    /// Socket open; `verified` once `hello-response` arrived.
    Connected {
        /// Whether the bridge acknowledged the handshake.
        verified: bool,
    },
    /// Retries exhausted; waits for a manual reconnect.
    GaveUp,
    /// Another browser took over the bridge; waits for a manual reconnect.
    Replaced,
    /// Torn down for good.
    Closed,
}

impl ConnectionState {
    /// Whether the handshake completed.
    pub fn is_verified(self) -> bool {
        matches!(self, Self::Connected { verified: true })
    }
}

/// What to do after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after this delay.
    Retry(Duration),
    /// Stop retrying.
    GaveUp,
}

/// Attempt counter plus the pending retry deadline.
#[derive(Debug)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    retry_at: Option<Instant>,
}

impl ReconnectController {
    /// Controller in [`ConnectionState::Disconnected`] with no failures.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            retry_at: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last verified connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The policy in effect.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Scheduled retry, if any.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Whether the controller may open a socket now.
    pub fn can_connect(&self) -> bool {
        matches!(self.state, ConnectionState::Disconnected)
    }

    /// A socket is being opened.
    pub fn on_connecting(&mut self) {
        if self.can_connect() {
            self.retry_at = None;
            self.state = ConnectionState::Connecting;
        }
    }

    /// The socket opened; the handshake is outstanding.
    pub fn on_open(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected { verified: false };
        }
    }

    /// The bridge answered the handshake. Resets the failure counter.
    pub fn on_verified(&mut self) {
        if matches!(self.state, ConnectionState::Connected { .. }) {
            self.state = ConnectionState::Connected { verified: true };
            self.attempt = 0;
        }
    }

    /// Connect, verify, or an established socket failed at `now`.
    pub fn on_failure(&mut self, now: Instant) -> RetryDecision {
        if matches!(
            self.state,
            ConnectionState::GaveUp | ConnectionState::Replaced | ConnectionState::Closed
        ) {
            return RetryDecision::GaveUp;
        }
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt >= self.policy.max_attempts {
            self.state = ConnectionState::GaveUp;
            self.retry_at = None;
            return RetryDecision::GaveUp;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.state = ConnectionState::Disconnected;
        self.retry_at = Some(now + delay);
        RetryDecision::Retry(delay)
    }

    /// The bridge handed the browser role to another page. No retry is
    /// scheduled, so two pages never evict each other in a loop.
    pub fn on_replaced(&mut self) {
        if self.state != ConnectionState::Closed {
            self.retry_at = None;
            self.state = ConnectionState::Replaced;
        }
    }

    /// Leave any non-terminal state and connect again right away with a fresh
    /// counter. Returns `false` once closed.
    pub fn manual_reconnect(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.retry_at = None;
        self.attempt = 0;
        self.state = ConnectionState::Disconnected;
        true
    }

    /// Cancel the pending retry and stop for good.
    pub fn teardown(&mut self) {
        self.retry_at = None;
        self.state = ConnectionState::Closed;
    }
}
