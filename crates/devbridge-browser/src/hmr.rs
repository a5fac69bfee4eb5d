//! Hot-reload capture debouncing.
//!
//! [`DebounceState`] decides when the next capture runs: once reloads have
//! been quiet for the debounce window, and never before the DOM had the settle
//! delay to catch up with the last one. [`HmrCapturer`]
//! owns the task that waits for that deadline, captures, and pushes
//! `hmr-screenshot`. Dropping the capturer aborts the task and with it any
//! scheduled capture.

use std::sync::Arc;
use std::time::Duration;

use devbridge_core::Envelope;
use devbridge_settings::HmrSettings;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::collaborators::{CaptureOptions, CaptureTarget, Renderer};
use crate::error::BrowserError;
use crate::log_buffer::LogBuffer;
use crate::outbox::Outbox;

/// Debounce bookkeeping.
#[derive(Clone, Debug)]
pub struct DebounceState {
    debounce: Duration,
    capture_delay: Duration,
    scheduled: Option<Instant>,
    sequence: u64,
}

impl DebounceState {
    /// Fresh state: nothing scheduled, sequence 0.
    pub fn new(debounce: Duration, capture_delay: Duration) -> Self {
        Self {
            debounce,
            capture_delay,
            scheduled: None,
            sequence: 0,
        }
    }

    /// Register a reload at `now` and return when the capture should run.
    ///
    /// Every reload pushes the deadline to `now + max(debounce, capture_delay)`,
    /// so reloads closer together than `debounce` share one capture and
    /// reloads further apart get one each.
    pub fn on_trigger(&mut self, now: Instant) -> Instant {
        let deadline = now + self.debounce.max(self.capture_delay);
        self.scheduled = Some(deadline);
        deadline
    }

    /// The pending capture deadline.
    pub fn scheduled(&self) -> Option<Instant> {
        self.scheduled
    }

    /// Clear the deadline if it has passed. Returns whether a capture is due.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.scheduled {
            Some(deadline) if deadline <= now => {
                self.scheduled = None;
                true
            }
            _ => false,
        }
    }

    /// Record a successful capture and return its sequence number.
    pub fn complete(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Sequence number of the last successful capture.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Handle to the capture task.
#[derive(Debug)]
pub struct HmrCapturer {
    enabled: bool,
    trigger_tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl HmrCapturer {
    /// Spawn the capture task.
    pub fn spawn(
        settings: &HmrSettings,
        renderer: Arc<dyn Renderer>,
        logs: Arc<LogBuffer>,
        outbox: Arc<Outbox>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let state = DebounceState::new(
            Duration::from_millis(settings.debounce_ms),
            Duration::from_millis(settings.capture_delay_ms),
        );
        let task = tokio::spawn(capture_loop(state, trigger_rx, renderer, logs, outbox));
        Self {
            enabled: settings.enabled,
            trigger_tx,
            task,
        }
    }

    /// Report a hot reload. No-op when HMR capture is disabled.
    pub fn trigger(&self) {
        if self.enabled {
            let _ = self.trigger_tx.send(());
        }
    }
}

impl Drop for HmrCapturer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn capture_loop(
    mut state: DebounceState,
    mut triggers: mpsc::UnboundedReceiver<()>,
    renderer: Arc<dyn Renderer>,
    logs: Arc<LogBuffer>,
    outbox: Arc<Outbox>,
) {
    loop {
        let deadline = state.scheduled();
        let wake_at = deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
                let now = Instant::now();
                let at = state.on_trigger(now);
                debug!(delay = ?at.saturating_duration_since(now), "hmr capture scheduled");
            }
            () = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                if !state.take_due(Instant::now()) {
                    continue;
                }
                match capture(renderer.as_ref(), &logs).await {
                    Ok(data) => {
                        let sequence = state.complete();
                        let envelope = hmr_envelope(sequence, data);
                        let _ = outbox.push(&envelope);
                        debug!(sequence, "hmr capture pushed");
                    }
                    Err(e) => warn!(error = %e, "hmr capture failed"),
                }
            }
        }
    }
}

async fn capture(renderer: &dyn Renderer, logs: &LogBuffer) -> Result<Value, BrowserError> {
    let image = renderer
        .capture(&CaptureTarget::Document, &CaptureOptions::default())
        .await?;
    Ok(json!({
        "screenshot": image.data_url(),
        "logs": logs.partition(),
    }))
}

fn hmr_envelope(sequence: u64, data: Value) -> Envelope {
    Envelope::new("hmr-screenshot")
        .with("sequence", Value::from(sequence))
        .with("data", data)
        .stamped()
}
