//! # autobridge-settings
//!
//! Layered configuration for the automation bridge.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`BridgeSettings::default()`]
//! 2. **User file**: `~/.autobridge/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `AUTOBRIDGE_*` overrides (highest priority)
//!
//! There is no process-wide copy: every bridge instance takes its
//! [`BridgeSettings`] by value.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path, validate};
pub use types::*;
