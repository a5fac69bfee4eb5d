//! Console log entries captured in the page and the filters agents use to
//! subscribe to them.

use serde::{Deserialize, Serialize};

/// Console method that produced a log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.debug`
    Debug,
    /// `console.log`
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    #[serde(alias = "warning")]
    Warn,
    /// `console.error`, uncaught errors, rejected promises
    Error,
}

impl LogLevel {
    /// Wire name of the level.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One console line as pushed by the browser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Rendered message text.
    pub message: String,
    /// Where the line came from (`console`, `network`, `hmr`, a file URL, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Milliseconds since the Unix epoch, as observed by the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Stack trace for errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl LogEntry {
    /// Entry with just a level and message.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            source: None,
            timestamp: None,
            stack: None,
        }
    }

    /// Builder-style source setter.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Log subscription filter. Every present criterion must hold.
///
/// `pattern` is a case-sensitive substring match against the message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    /// Accepted levels; absent means all levels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<LogLevel>>,
    /// Substring the message must contain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Exact source the entry must carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LogFilter {
    /// Whether `entry` passes this filter.
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(levels) = &self.levels {
            if !levels.contains(&entry.level) {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern {
            if !entry.message.contains(pattern.as_str()) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if entry.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors_only() -> LogFilter {
        LogFilter {
            levels: Some(vec![LogLevel::Error]),
            ..LogFilter::default()
        }
    }

    #[test]
    fn level_filter_rejects_warn() {
        let entry = LogEntry::new(LogLevel::Warn, "deprecated api");
        assert!(!errors_only().matches(&entry));
    }

    #[test]
    fn level_filter_accepts_error() {
        let entry = LogEntry::new(LogLevel::Error, "boom");
        assert!(errors_only().matches(&entry));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = LogFilter::default();
        assert!(filter.matches(&LogEntry::new(LogLevel::Debug, "")));
        assert!(filter.matches(&LogEntry::new(LogLevel::Error, "x")));
    }

    #[test]
    fn pattern_is_case_sensitive_substring() {
        let filter = LogFilter {
            pattern: Some("Failed".into()),
            ..LogFilter::default()
        };
        assert!(filter.matches(&LogEntry::new(LogLevel::Log, "Request Failed: 500")));
        assert!(!filter.matches(&LogEntry::new(LogLevel::Log, "request failed")));
    }

    #[test]
    fn pattern_is_not_a_regex() {
        let filter = LogFilter {
            pattern: Some("a.c".into()),
            ..LogFilter::default()
        };
        assert!(!filter.matches(&LogEntry::new(LogLevel::Log, "abc")));
        assert!(filter.matches(&LogEntry::new(LogLevel::Log, "xa.cx")));
    }

    #[test]
    fn source_must_match_exactly() {
        let filter = LogFilter {
            source: Some("network".into()),
            ..LogFilter::default()
        };
        assert!(filter.matches(&LogEntry::new(LogLevel::Log, "x").with_source("network")));
        assert!(!filter.matches(&LogEntry::new(LogLevel::Log, "x").with_source("console")));
        assert!(!filter.matches(&LogEntry::new(LogLevel::Log, "x")));
    }

    #[test]
    fn all_criteria_combine() {
        let filter = LogFilter {
            levels: Some(vec![LogLevel::Warn, LogLevel::Error]),
            pattern: Some("hydration".into()),
            source: None,
        };
        assert!(filter.matches(&LogEntry::new(LogLevel::Warn, "hydration mismatch")));
        assert!(!filter.matches(&LogEntry::new(LogLevel::Info, "hydration mismatch")));
        assert!(!filter.matches(&LogEntry::new(LogLevel::Error, "other")));
    }

    #[test]
    fn warning_alias_deserializes() {
        let level: LogLevel = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(level, LogLevel::Warn);
    }

    #[test]
    fn filter_deserializes_from_camel_case() {
        let filter: LogFilter =
            serde_json::from_str(r#"{"levels":["error","warn"],"pattern":"x"}"#).unwrap();
        assert_eq!(filter.levels.unwrap().len(), 2);
        assert_eq!(filter.pattern.as_deref(), Some("x"));
        assert!(filter.source.is_none());
    }
}
