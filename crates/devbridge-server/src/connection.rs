//! Per-socket state shared between the session task and the router.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use devbridge_core::{ConnectionId, Envelope, Role};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A live socket as seen by the router.
///
/// Outbound frames go through a bounded queue drained by the session's writer
/// task; `send` never blocks, so it is safe to call while the router lock is
/// held.
pub struct BridgeConnection {
    /// Identifier assigned at accept time.
    pub id: ConnectionId,
    role: Mutex<Role>,
    tx: mpsc::Sender<Arc<String>>,
    /// When the socket was accepted.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    dropped_messages: AtomicU64,
    closed: CancellationToken,
}

impl BridgeConnection {
    /// New agent-role connection writing into `tx`.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            role: Mutex::new(Role::Agent),
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Current role.
    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    /// Whether this connection has announced itself as the browser.
    pub fn is_browser(&self) -> bool {
        self.role() == Role::Browser
    }

    pub(crate) fn set_role(&self, role: Role) {
        *self.role.lock() = role;
    }

    /// Queue a text frame.
    ///
    /// Returns `false` when the queue is full or the writer is gone, and
    /// counts the drop.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.closed.is_cancelled() {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        self.send(Arc::new(envelope.to_json()))
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity (any frame, including Pong).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Read and reset the alive flag. `true` if anything arrived since the
    /// previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Ask the session to close the socket. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close` has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl std::fmt::Debug for BridgeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConnection")
            .field("id", &self.id)
            .field("role", &self.role())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn make_connection(
        id: &str,
    ) -> (Arc<BridgeConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        (Arc::new(BridgeConnection::new(ConnectionId::from(id), tx)), rx)
    }

    #[test]
    fn new_connection_is_agent() {
        let (conn, _rx) = make_connection("conn_1");
        assert_eq!(conn.role(), Role::Agent);
        assert!(!conn.is_browser());
        assert!(!conn.is_closed());
    }

    #[test]
    fn set_role_to_browser() {
        let (conn, _rx) = make_connection("conn_1");
        conn.set_role(Role::Browser);
        assert!(conn.is_browser());
    }

    #[tokio::test]
    async fn send_envelope_serializes() {
        let (conn, mut rx) = make_connection("conn_1");
        let env = Envelope::success("pong", Some("r1"), json!({}));
        assert!(conn.send_envelope(&env));
        let text = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "pong");
        assert_eq!(parsed["requestId"], "r1");
    }

    #[tokio::test]
    async fn send_to_full_queue_counts_drop() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = BridgeConnection::new(ConnectionId::from("conn_2"), tx);
        assert!(conn.send(Arc::new("a".into())));
        assert!(!conn.send(Arc::new("b".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn send_after_writer_gone_fails() {
        let (tx, rx) = mpsc::channel(4);
        let conn = BridgeConnection::new(ConnectionId::from("conn_3"), tx);
        drop(rx);
        assert!(!conn.send(Arc::new("a".into())));
    }

    #[test]
    fn send_after_close_fails() {
        let (conn, _rx) = make_connection("conn_4");
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(!conn.send(Arc::new("a".into())));
    }

    #[tokio::test]
    async fn closed_future_resolves() {
        let (conn, _rx) = make_connection("conn_5");
        let waiter = conn.clone();
        let handle = tokio::spawn(async move {
            waiter.closed().await;
        });
        conn.close();
        handle.await.unwrap();
    }

    #[test]
    fn check_alive_resets_flag() {
        let (conn, _rx) = make_connection("conn_6");
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }
}
