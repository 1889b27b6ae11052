//! Settings types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{Result, SettingsError};

/// Production real-time endpoint.
pub const PROD_WS_URL: &str = "wss://realtime.parley.chat/ws";
/// Production HTTP endpoint.
pub const PROD_HTTP_URL: &str = "https://api.parley.chat/v1";
/// Development real-time endpoint.
pub const DEV_WS_URL: &str = "wss://realtime.dev.parley.chat/ws";
/// Development HTTP endpoint.
pub const DEV_HTTP_URL: &str = "https://api.dev.parley.chat/v1";

/// Root client settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Which backend to talk to.
    pub environment: Environment,
    /// Explicit endpoints, used when `environment` is `custom`.
    pub endpoints: Endpoints,
    /// Operation timeouts.
    pub timeouts: TimeoutSettings,
    /// Reconnect policy.
    pub reconnect: ReconnectSettings,
    /// How confirmed operations are delivered.
    pub delivery: DeliveryStrategy,
    /// Lifetime requested for refreshed file links in transcripts.
    pub file_link_ttl_secs: u64,
    /// Default log level for binaries.
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            environment: Environment::Prod,
            endpoints: Endpoints::default(),
            timeouts: TimeoutSettings::default(),
            reconnect: ReconnectSettings::default(),
            delivery: DeliveryStrategy::Rest,
            file_link_ttl_secs: 3_600,
            log_level: "warn".to_string(),
        }
    }
}

impl ClientSettings {
    /// Settings pointing at explicit endpoints.
    pub fn custom(ws_url: impl Into<String>, http_url: impl Into<String>) -> Self {
        Self {
            environment: Environment::Custom,
            endpoints: Endpoints {
                ws_url: ws_url.into(),
                http_url: http_url.into(),
            },
            ..Self::default()
        }
    }

    /// Resolve the endpoint pair for the selected environment.
    pub fn resolved_endpoints(&self) -> Result<ResolvedEndpoints> {
        let (ws, http) = match self.environment {
            Environment::Prod => (PROD_WS_URL, PROD_HTTP_URL),
            Environment::Dev => (DEV_WS_URL, DEV_HTTP_URL),
            Environment::Custom => (self.endpoints.ws_url.as_str(), self.endpoints.http_url.as_str()),
        };
        let ws_url = Url::parse(ws)
            .map_err(|e| SettingsError::InvalidValue(format!("wsUrl {ws:?}: {e}")))?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(SettingsError::InvalidValue(format!(
                "wsUrl must use ws or wss, got {}",
                ws_url.scheme()
            )));
        }
        let http_url = Url::parse(http)
            .map_err(|e| SettingsError::InvalidValue(format!("httpUrl {http:?}: {e}")))?;
        if !matches!(http_url.scheme(), "http" | "https") {
            return Err(SettingsError::InvalidValue(format!(
                "httpUrl must use http or https, got {}",
                http_url.scheme()
            )));
        }
        Ok(ResolvedEndpoints { ws_url, http_url })
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let _ = self.resolved_endpoints()?;
        if self.reconnect.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "reconnect.maxAttempts must be at least 1".into(),
            ));
        }
        if self.timeouts.handshake_ms == 0 || self.timeouts.confirm_ms == 0 {
            return Err(SettingsError::InvalidValue("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Backend environment selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Production endpoints.
    #[default]
    Prod,
    /// Development endpoints.
    Dev,
    /// Endpoints from [`Endpoints`].
    Custom,
}

impl Environment {
    /// Parse `prod` / `dev` / `custom` (case-insensitive).
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_lowercase().as_str() {
            "prod" | "production" => Some(Self::Prod),
            "dev" | "development" => Some(Self::Dev),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Explicit endpoint pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoints {
    /// Real-time (WebSocket) URL.
    pub ws_url: String,
    /// HTTP base URL.
    pub http_url: String,
}

/// Parsed endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    /// Real-time (WebSocket) URL.
    pub ws_url: Url,
    /// HTTP base URL.
    pub http_url: Url,
}

/// Operation timeouts, in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutSettings {
    /// Wait for the `socket_connected` handshake.
    pub handshake_ms: u64,
    /// Wait for a correlated reply to most confirmed operations.
    pub confirm_ms: u64,
    /// Wait for a correlated reply to metadata updates.
    pub metadata_ms: u64,
    /// HTTP request timeout on the side channel.
    pub http_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            handshake_ms: 10_000,
            confirm_ms: 10_000,
            metadata_ms: 15_000,
            http_ms: 30_000,
        }
    }
}

impl TimeoutSettings {
    /// Handshake budget.
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    /// Correlated-reply budget for most confirmed operations.
    pub fn confirm(&self) -> Duration {
        Duration::from_millis(self.confirm_ms)
    }

    /// Correlated-reply budget for metadata updates.
    pub fn metadata(&self) -> Duration {
        Duration::from_millis(self.metadata_ms)
    }

    /// HTTP request budget.
    pub fn http(&self) -> Duration {
        Duration::from_millis(self.http_ms)
    }
}

/// Reconnect policy: bounded attempts with a fixed delay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Consecutive failed attempts before giving up for good.
    pub max_attempts: u32,
    /// Delay after a failed attempt.
    pub delay_ms: u64,
    /// Delay before the single attempt that follows an abnormal close.
    pub unsolicited_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 2_000,
            unsolicited_delay_ms: 1_000,
        }
    }
}

impl ReconnectSettings {
    /// Delay after a failed attempt.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Delay before reconnecting after an abnormal close.
    pub fn unsolicited_delay(&self) -> Duration {
        Duration::from_millis(self.unsolicited_delay_ms)
    }
}

/// How confirmed operations learn that the backend accepted them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStrategy {
    /// Send over the real-time channel and wait for a correlated reply.
    Realtime,
    /// POST to the HTTP endpoint and use its response as confirmation.
    #[default]
    Rest,
}

impl DeliveryStrategy {
    /// Parse `realtime` / `rest` (case-insensitive).
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_lowercase().as_str() {
            "realtime" | "socket" | "ws" => Some(Self::Realtime),
            "rest" | "http" => Some(Self::Rest),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prod_endpoints_resolve() {
        let eps = ClientSettings::default().resolved_endpoints().unwrap();
        assert_eq!(eps.ws_url.as_str(), PROD_WS_URL);
        assert_eq!(eps.http_url.scheme(), "https");
    }

    #[test]
    fn dev_endpoints_resolve() {
        let settings = ClientSettings {
            environment: Environment::Dev,
            ..Default::default()
        };
        let eps = settings.resolved_endpoints().unwrap();
        assert_eq!(eps.ws_url.as_str(), DEV_WS_URL);
    }

    #[test]
    fn custom_endpoints_resolve() {
        let settings = ClientSettings::custom("ws://127.0.0.1:9000/ws", "http://127.0.0.1:9001");
        let eps = settings.resolved_endpoints().unwrap();
        assert_eq!(eps.ws_url.port(), Some(9000));
        assert_eq!(eps.http_url.port(), Some(9001));
    }

    #[test]
    fn custom_with_wrong_scheme_rejected() {
        let settings = ClientSettings::custom("http://127.0.0.1", "http://127.0.0.1");
        let err = settings.resolved_endpoints().unwrap_err();
        assert!(err.to_string().contains("ws or wss"));
    }

    #[test]
    fn custom_without_endpoints_rejected() {
        let settings = ClientSettings {
            environment: Environment::Custom,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut settings = ClientSettings::default();
        settings.reconnect.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parse_environment() {
        assert_eq!(Environment::parse("PROD"), Some(Environment::Prod));
        assert_eq!(Environment::parse("development"), Some(Environment::Dev));
        assert_eq!(Environment::parse("custom"), Some(Environment::Custom));
        assert_eq!(Environment::parse("staging"), None);
    }

    #[test]
    fn parse_delivery() {
        assert_eq!(DeliveryStrategy::parse("Realtime"), Some(DeliveryStrategy::Realtime));
        assert_eq!(DeliveryStrategy::parse("http"), Some(DeliveryStrategy::Rest));
        assert_eq!(DeliveryStrategy::parse("carrier-pigeon"), None);
    }

    #[test]
    fn camel_case_wire_names() {
        let json = serde_json::to_value(ClientSettings::default()).unwrap();
        assert_eq!(json["timeouts"]["metadataMs"], 15_000);
        assert_eq!(json["reconnect"]["maxAttempts"], 5);
        assert_eq!(json["delivery"], "rest");
        assert_eq!(json["fileLinkTtlSecs"], 3_600);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: ClientSettings =
            serde_json::from_str(r#"{"delivery":"realtime","reconnect":{"delayMs":5}}"#).unwrap();
        assert_eq!(settings.delivery, DeliveryStrategy::Realtime);
        assert_eq!(settings.reconnect.delay_ms, 5);
        assert_eq!(settings.reconnect.max_attempts, 5);
        assert_eq!(settings.timeouts.metadata_ms, 15_000);
    }

    #[test]
    fn durations() {
        let settings = ClientSettings::default();
        assert_eq!(settings.timeouts.handshake(), Duration::from_secs(10));
        assert_eq!(settings.timeouts.confirm(), Duration::from_secs(10));
        assert_eq!(settings.timeouts.metadata(), Duration::from_secs(15));
        assert_eq!(settings.reconnect.delay(), Duration::from_secs(2));
        assert_eq!(settings.reconnect.unsolicited_delay(), Duration::from_secs(1));
    }
}
