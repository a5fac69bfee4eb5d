//! Bounded in-page console log buffer.

use std::collections::VecDeque;

use devbridge_core::{LogEntry, LogFilter, LogLevel};
use parking_lot::Mutex;
use serde::Serialize;

/// Default number of entries retained.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Buffer contents split by severity, as attached to HMR captures and
/// `save-logs`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LogPartition {
    /// Every buffered entry, oldest first.
    pub all: Vec<LogEntry>,
    /// `error` entries.
    pub errors: Vec<LogEntry>,
    /// `warn` entries.
    pub warnings: Vec<LogEntry>,
}

/// Ring buffer of the most recent console entries.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogBuffer {
    /// Buffer holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            let _ = entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries passing `filter`, oldest first, keeping the newest `limit`.
    pub fn snapshot(&self, filter: &LogFilter, limit: Option<usize>) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let matched: Vec<LogEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        match limit {
            Some(limit) if matched.len() > limit => matched[matched.len() - limit..].to_vec(),
            _ => matched,
        }
    }

    /// Everything, plus the errors and warnings on their own.
    pub fn partition(&self) -> LogPartition {
        let entries = self.entries.lock();
        let all: Vec<LogEntry> = entries.iter().cloned().collect();
        let of_level = |level: LogLevel| -> Vec<LogEntry> {
            all.iter().filter(|e| e.level == level).cloned().collect()
        };
        LogPartition {
            errors: of_level(LogLevel::Error),
            warnings: of_level(LogLevel::Warn),
            all,
        }
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}
