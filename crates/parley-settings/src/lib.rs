//! # parley-settings
//!
//! Client configuration with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **User file**: `~/.parley/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PARLEY_*` overrides (highest priority)
//!
//! There is no global instance: the composition root loads settings once and
//! hands them to each client it builds.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = ClientSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = ClientSettings::default();
        assert_eq!(settings.environment, Environment::Prod);
        assert_eq!(settings.timeouts.handshake_ms, 10_000);
        assert_eq!(settings.timeouts.confirm_ms, 10_000);
        assert_eq!(settings.timeouts.metadata_ms, 15_000);
        assert_eq!(settings.reconnect.max_attempts, 5);
        assert_eq!(settings.delivery, DeliveryStrategy::Rest);
        assert!(settings.validate().is_ok());
    }
}
