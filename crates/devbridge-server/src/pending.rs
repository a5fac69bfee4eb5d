//! Pending-request table.
//!
//! One entry per forwarded request, keyed by the caller's `requestId`. An
//! entry leaves the table exactly once: through `resolve` (reply arrived),
//! `expire` (its timer fired), `cancel`, or one of the drains (disconnect,
//! shutdown). Every path except `expire` aborts the timer; `expire` is called
//! from the timer itself and only acts when the generation token matches, so
//! a late timer can never take out a newer entry that reused the id.

use std::collections::HashMap;
use std::time::Duration;

use devbridge_core::{BridgeError, ConnectionId};
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// A request awaiting its reply.
#[derive(Debug)]
pub struct PendingRequest {
    /// Correlation key.
    pub request_id: String,
    /// Connection that issued the request and receives the reply.
    pub origin: ConnectionId,
    /// Browser connection the request was forwarded to.
    pub target: ConnectionId,
    /// `type` used for a synthesized failure reply.
    pub failure_type: String,
    /// Deadline.
    pub expires_at: Instant,
    token: u64,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Parameters of a new entry.
#[derive(Debug, Clone)]
pub struct NewPending {
    /// Correlation key.
    pub request_id: String,
    /// Requesting connection.
    pub origin: ConnectionId,
    /// Browser connection.
    pub target: ConnectionId,
    /// `type` used for a synthesized failure reply.
    pub failure_type: String,
    /// Time until expiry.
    pub timeout: Duration,
}

/// Table of in-flight requests.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingRequest>,
    next_token: u64,
}

impl PendingTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry and arm its timer.
    ///
    /// `arm` receives the entry's generation token and must start the expiry
    /// timer, returning a handle to abort it. A live entry with the same id
    /// is left untouched and the call fails with `DuplicateRequestId`; `arm`
    /// is not invoked in that case.
    pub fn create(
        &mut self,
        new: NewPending,
        arm: impl FnOnce(u64) -> AbortHandle,
    ) -> Result<u64, BridgeError> {
        if self.entries.contains_key(&new.request_id) {
            return Err(BridgeError::DuplicateRequestId {
                request_id: new.request_id,
            });
        }

        self.next_token += 1;
        let token = self.next_token;
        let timer = arm(token);
        let entry = PendingRequest {
            request_id: new.request_id.clone(),
            origin: new.origin,
            target: new.target,
            failure_type: new.failure_type,
            expires_at: Instant::now() + new.timeout,
            token,
            timer: Some(timer),
        };
        let _ = self.entries.insert(new.request_id, entry);
        Ok(token)
    }

    /// Consume the entry for a reply. `None` for unknown, resolved, or
    /// expired ids.
    pub fn resolve(&mut self, request_id: &str) -> Option<PendingRequest> {
        let mut entry = self.entries.remove(request_id)?;
        entry.disarm();
        Some(entry)
    }

    /// Consume the entry on behalf of its timer.
    ///
    /// Acts only if the entry still carries `token`.
    pub fn expire(&mut self, request_id: &str, token: u64) -> Option<PendingRequest> {
        if self.entries.get(request_id)?.token != token {
            return None;
        }
        let mut entry = self.entries.remove(request_id)?;
        entry.timer = None;
        Some(entry)
    }

    /// Drop an entry without replying.
    pub fn cancel(&mut self, request_id: &str) -> bool {
        self.resolve(request_id).is_some()
    }

    /// Browser the entry was forwarded to.
    pub fn target_of(&self, request_id: &str) -> Option<&ConnectionId> {
        self.entries.get(request_id).map(|e| &e.target)
    }

    /// Remove every entry issued by `origin`.
    pub fn drain_origin(&mut self, origin: &ConnectionId) -> Vec<PendingRequest> {
        self.drain_where(|e| &e.origin == origin)
    }

    /// Remove every entry forwarded to `target`.
    pub fn drain_target(&mut self, target: &ConnectionId) -> Vec<PendingRequest> {
        self.drain_where(|e| &e.target == target)
    }

    /// Remove every entry.
    pub fn drain_all(&mut self) -> Vec<PendingRequest> {
        self.drain_where(|_| true)
    }

    fn drain_where(&mut self, pred: impl Fn(&PendingRequest) -> bool) -> Vec<PendingRequest> {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| pred(e))
            .map(|e| e.request_id.clone())
            .collect();
        ids.iter().filter_map(|id| self.resolve(id)).collect()
    }

    /// Whether `request_id` is in flight.
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
