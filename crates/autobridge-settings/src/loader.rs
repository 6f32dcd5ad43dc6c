//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`BridgeSettings::default()`]
//! 2. If `~/.autobridge/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `AUTOBRIDGE_*` environment overrides (highest priority)
//! 4. Validate
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

/// Resolve the path to the settings file (`~/.autobridge/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".autobridge").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BridgeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// [`validate`] is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BridgeSettings> {
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

    let mut settings: BridgeSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
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

/// Reject settings the bridge cannot run with.
pub fn validate(settings: &BridgeSettings) -> Result<()> {
    if settings.ports.is_empty() {
        return Err(SettingsError::invalid("ports", "must not be empty"));
    }
    if settings.ports.contains(&0) {
        return Err(SettingsError::invalid("ports", "port 0 is not connectable"));
    }
    if settings.host.trim().is_empty() {
        return Err(SettingsError::invalid("host", "must not be empty"));
    }
    if settings.limits.max_pending_requests == 0 {
        return Err(SettingsError::invalid(
            "limits.maxPendingRequests",
            "must be at least 1",
        ));
    }
    if settings.heartbeat.interval_ms > 0
        && settings.heartbeat.timeout_ms < settings.heartbeat.interval_ms
    {
        return Err(SettingsError::invalid(
            "heartbeat.timeoutMs",
            format!(
                "{} is shorter than heartbeat.intervalMs ({})",
                settings.heartbeat.timeout_ms, settings.heartbeat.interval_ms
            ),
        ));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within range, booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Anything else is ignored
/// with a warning.
pub fn apply_env_overrides(settings: &mut BridgeSettings) {
    if let Some(v) = read_env_bool("AUTOBRIDGE_ENABLED") {
        settings.enabled = v;
    }
    if let Some(v) = read_env_string("AUTOBRIDGE_HOST") {
        settings.host = v;
    }
    if let Some(v) = read_env_string("AUTOBRIDGE_PORT") {
        match parse_port_list(&v) {
            Some(ports) => settings.ports = ports,
            None => tracing::warn!(key = "AUTOBRIDGE_PORT", value = %v, "invalid port list, ignoring"),
        }
    }
    if let Some(v) = read_env_string("AUTOBRIDGE_CAPABILITY_TOKEN") {
        settings.capability_token = Some(v);
    }
    if let Some(v) = read_env_string("AUTOBRIDGE_LOG_LEVEL") {
        settings.log_level = v;
    }

    // ── Timing ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("AUTOBRIDGE_REQUEST_TIMEOUT_MS", 1, 3_600_000) {
        settings.timeouts.request_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("AUTOBRIDGE_HEARTBEAT_INTERVAL_MS", 0, 600_000) {
        settings.heartbeat.interval_ms = v;
    }

    // ── Limits ──────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("AUTOBRIDGE_MAX_PENDING", 1, 10_000) {
        settings.limits.max_pending_requests = v;
    }
    if let Some(v) = read_env_usize("AUTOBRIDGE_MAX_QUEUED", 0, 100_000) {
        settings.limits.max_queued_requests = v;
    }

    // ── Auto-launch ─────────────────────────────────────────────────
    if let Some(v) = read_env_bool("AUTOBRIDGE_AUTO_LAUNCH") {
        settings.auto_launch.enabled = v;
    }
    if let Some(v) = read_env_string("AUTOBRIDGE_PROJECT_PATH") {
        settings.auto_launch.project_path = Some(v);
    }
    if let Some(v) = read_env_string("AUTOBRIDGE_EDITOR_PATH") {
        settings.auto_launch.editor_path = Some(v);
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a comma-separated list of ports (`"8090"` or `"8090,8091"`).
pub fn parse_port_list(val: &str) -> Option<Vec<u16>> {
    let ports = val
        .split(',')
        .map(|p| parse_u16_range(p.trim(), 1, 65535))
        .collect::<Option<Vec<_>>>()?;
    (!ports.is_empty()).then_some(ports)
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

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
