//! # devbridge-settings
//!
//! Layered configuration: compiled defaults, then `~/.devbridge/settings.json`
//! deep-merged over them, then `DEVBRIDGE_*` environment overrides.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{
    BridgeSettings, ExecSettings, HmrSettings, LoggingSettings, PersistenceSettings,
    ReconnectSettings, RequestSettings, ServerSettings,
};
