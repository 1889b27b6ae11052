//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ClientSettings::default()`]
//! 2. If `~/.parley/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PARLEY_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ClientSettings, DeliveryStrategy, Environment};

/// Resolve the path to the settings file (`~/.parley/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<ClientSettings> {
    let defaults = serde_json::to_value(ClientSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
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

/// Apply process environment overrides.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_overrides_from(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PARLEY_ENV") {
        match Environment::parse(&v) {
            Some(env) => settings.environment = env,
            None => warn!(key = "PARLEY_ENV", value = %v, "invalid environment, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_WS_URL") {
        settings.endpoints.ws_url = v;
        settings.environment = Environment::Custom;
    }
    if let Some(v) = read("PARLEY_HTTP_URL") {
        settings.endpoints.http_url = v;
        settings.environment = Environment::Custom;
    }
    if let Some(v) = read("PARLEY_DELIVERY") {
        match DeliveryStrategy::parse(&v) {
            Some(d) => settings.delivery = d,
            None => warn!(key = "PARLEY_DELIVERY", value = %v, "invalid delivery strategy, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_MAX_RECONNECT_ATTEMPTS") {
        match parse_u32_range(&v, 1, 100) {
            Some(n) => settings.reconnect.max_attempts = n,
            None => warn!(key = "PARLEY_MAX_RECONNECT_ATTEMPTS", value = %v, "invalid u32 env var, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_RECONNECT_DELAY_MS") {
        match parse_u64_range(&v, 0, 600_000) {
            Some(n) => settings.reconnect.delay_ms = n,
            None => warn!(key = "PARLEY_RECONNECT_DELAY_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_CONFIRM_TIMEOUT_MS") {
        match parse_u64_range(&v, 100, 600_000) {
            Some(n) => settings.timeouts.confirm_ms = n,
            None => warn!(key = "PARLEY_CONFIRM_TIMEOUT_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_HANDSHAKE_TIMEOUT_MS") {
        match parse_u64_range(&v, 100, 600_000) {
            Some(n) => settings.timeouts.handshake_ms = n,
            None => warn!(key = "PARLEY_HANDSHAKE_TIMEOUT_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("PARLEY_LOG_LEVEL") {
        settings.log_level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
