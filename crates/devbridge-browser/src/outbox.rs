//! Best-effort outbound path for browser push events.
//!
//! Pushes (`console-log`, `hmr-screenshot`, toolbar saves) are produced
//! independently of the socket's lifetime. While a session is live the outbox
//! holds that session's queue; otherwise pushes are dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};

use devbridge_core::Envelope;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Shared handle to the current session's outbound queue.
#[derive(Debug, Default)]
pub struct Outbox {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    dropped: AtomicU64,
}

impl Outbox {
    /// Detached outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route pushes into `tx` until [`Outbox::detach`].
    pub fn attach(&self, tx: mpsc::Sender<String>) {
        *self.tx.lock() = Some(tx);
    }

    /// Stop routing pushes.
    pub fn detach(&self) {
        *self.tx.lock() = None;
    }

    /// Whether a session is attached.
    pub fn is_attached(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Queue `envelope` without waiting. Returns `false` if it was dropped.
    pub fn push(&self, envelope: &Envelope) -> bool {
        let sent = self
            .tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.try_send(envelope.to_json()).is_ok());
        if !sent {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(envelope_type = envelope.kind(), "push dropped, bridge not reachable");
        }
        sent
    }

    /// Pushes dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
