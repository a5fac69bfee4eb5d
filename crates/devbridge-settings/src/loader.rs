//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BridgeSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `DEVBRIDGE_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::BridgeSettings;

/// Resolve the path to the settings file (`~/.devbridge/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".devbridge").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BridgeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BridgeSettings> {
    let mut settings = merge_file(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<BridgeSettings> {
    let defaults = serde_json::to_value(BridgeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup` (the process environment in
/// production, a map in tests).
///
/// Invalid values are ignored with a warning.
pub fn apply_overrides(settings: &mut BridgeSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("DEVBRIDGE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("DEVBRIDGE_PORT") {
        if let Some(port) = checked("DEVBRIDGE_PORT", &v, |v| parse_u16_range(v, 1, 65535)) {
            settings.server.port = port;
        }
    }
    if let Some(v) = read("DEVBRIDGE_APP_PORT") {
        if let Some(port) = checked("DEVBRIDGE_APP_PORT", &v, |v| parse_u16_range(v, 1, 65535)) {
            settings.server.app_port = Some(port);
        }
    }
    if let Some(v) = read("DEVBRIDGE_REQUEST_TIMEOUT_MS") {
        if let Some(ms) = checked("DEVBRIDGE_REQUEST_TIMEOUT_MS", &v, |v| {
            parse_u64_range(v, 100, 600_000)
        }) {
            settings.requests.timeout_ms = ms;
        }
    }
    if let Some(v) = read("DEVBRIDGE_OUTPUT_DIR") {
        settings.persistence.output_dir = v;
    }
    if let Some(v) = read("DEVBRIDGE_ALLOW_EXEC") {
        if let Some(enabled) = checked("DEVBRIDGE_ALLOW_EXEC", &v, parse_bool) {
            settings.exec.enabled = enabled;
        }
    }
    if let Some(v) = read("DEVBRIDGE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

fn checked<T>(name: &str, raw: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let result = parse(raw);
    if result.is_none() {
        tracing::warn!(key = name, value = %raw, "invalid env var, ignoring");
    }
    result
}

fn validate(settings: &BridgeSettings) -> Result<()> {
    let r = &settings.reconnect;
    if r.base_delay_ms == 0 || r.base_delay_ms > r.max_delay_ms {
        return Err(SettingsError::Invalid {
            field: "reconnect.baseDelayMs",
            reason: format!(
                "{} must be in 1..=maxDelayMs ({})",
                r.base_delay_ms, r.max_delay_ms
            ),
        });
    }
    if settings.requests.timeout_ms == 0 {
        return Err(SettingsError::Invalid {
            field: "requests.timeoutMs",
            reason: "must be positive".into(),
        });
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
