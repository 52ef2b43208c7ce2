//! Configuration for the invoker service
//!
//! Every tunable that would otherwise live as an inline constant (retry
//! bounds, timeouts, the Authorization template) sits in a named settings
//! struct with a `Default`. Endpoint-specific data never lives here; that is
//! the `EndpointConfig` owned by the endpoint store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings for the invoker service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerSettings {
    /// HTTP client settings shared by all protocols
    pub http: HttpSettings,
    /// Retry policy for transport-level failures on the synchronous protocol
    pub retry: RetrySettings,
    /// Relay transport and dispatch settings
    pub relay: RelaySettings,
}

/// HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Request timeout in seconds (default: 30)
    pub request_timeout: u64,
    /// Connect timeout in seconds (default: 10)
    pub connect_timeout: u64,
    /// User-Agent sent on outbound requests and websocket handshakes
    pub user_agent: String,
    /// Authorization header template applied when a token resolves and the
    /// endpoint did not set Authorization itself
    pub auth_header_template: String,
}

/// Retry policy for transport-level network failures
///
/// Applies only to connect/timeout/DNS failures on the synchronous protocol;
/// HTTP error statuses are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first (default: 3)
    pub max_attempts: u32,
    /// Backoff before the second attempt in milliseconds (default: 1000)
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds (default: 10000)
    pub max_backoff_ms: u64,
    /// Exponential multiplier between attempts (default: 2.0)
    pub multiplier: f64,
}

impl RetrySettings {
    /// Backoff to sleep after the given zero-based failed attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let backoff =
            (self.initial_backoff_ms as f64) * self.multiplier.powi(attempt as i32);
        Duration::from_millis(backoff.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Relay transport and dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Redis URL of the relay broker; the relay path is unavailable when unset
    pub url: Option<String>,
    /// Prefix for every relay channel and presence key
    pub key_prefix: String,
    /// Round-trip ceiling for local and relayed calls in seconds (default: 30)
    pub dispatch_timeout: u64,
    /// Whether this process is a background worker without local connections
    pub worker_mode: bool,
}

impl RelaySettings {
    pub fn dispatch_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout)
    }
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            http: HttpSettings::default(),
            retry: RetrySettings::default(),
            relay: RelaySettings::default(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout: 30,
            connect_timeout: 10,
            user_agent: format!("invoker-service/{}", env!("CARGO_PKG_VERSION")),
            auth_header_template: "Bearer {{access_token}}".to_string(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "invoker:".to_string(),
            dispatch_timeout: 30,
            worker_mode: false,
        }
    }
}

impl InvokerSettings {
    /// Load settings from environment variables
    ///
    /// Variables use the `INVOKER` prefix with `__` between levels, e.g.
    /// `INVOKER__RELAY__URL=redis://localhost:6379`.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let defaults = InvokerSettings::default();
        let cfg = config::Config::builder()
            .set_default("http.request_timeout", defaults.http.request_timeout)?
            .set_default("http.connect_timeout", defaults.http.connect_timeout)?
            .set_default("http.user_agent", defaults.http.user_agent)?
            .set_default(
                "http.auth_header_template",
                defaults.http.auth_header_template,
            )?
            .set_default("retry.max_attempts", defaults.retry.max_attempts as i64)?
            .set_default(
                "retry.initial_backoff_ms",
                defaults.retry.initial_backoff_ms,
            )?
            .set_default("retry.max_backoff_ms", defaults.retry.max_backoff_ms)?
            .set_default("retry.multiplier", defaults.retry.multiplier)?
            .set_default("relay.key_prefix", defaults.relay.key_prefix)?
            .set_default("relay.dispatch_timeout", defaults.relay.dispatch_timeout)?
            .set_default("relay.worker_mode", defaults.relay.worker_mode)?
            .add_source(config::Environment::with_prefix("INVOKER").separator("__"))
            .build()?;

        cfg.try_deserialize()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), String> {
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            return Err("retry.multiplier must be at least 1.0".to_string());
        }
        if self.relay.dispatch_timeout == 0 {
            return Err("relay.dispatch_timeout cannot be 0".to_string());
        }
        if let Some(url) = &self.relay.url {
            url::Url::parse(url).map_err(|e| format!("Invalid relay URL: {}", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = InvokerSettings::default();
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.initial_backoff_ms, 1_000);
        assert_eq!(settings.retry.max_backoff_ms, 10_000);
        assert_eq!(settings.relay.dispatch_timeout, 30);
        assert!(settings.relay.url.is_none());
        assert!(!settings.relay.worker_mode);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_backoff_schedule_caps() {
        let retry = RetrySettings::default();
        assert_eq!(retry.backoff_for(0), Duration::from_secs(1));
        assert_eq!(retry.backoff_for(1), Duration::from_secs(2));
        assert_eq!(retry.backoff_for(2), Duration::from_secs(4));
        // Deep attempts hit the ceiling instead of growing without bound
        assert_eq!(retry.backoff_for(10), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = InvokerSettings::default();
        settings.retry.max_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = InvokerSettings::default();
        settings.relay.url = Some("not a url".to_string());
        assert!(settings.validate().is_err());
    }
}
