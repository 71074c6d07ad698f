//! Service configuration from environment variables.
//!
//! Each concern gets its own struct with defaults suitable for local
//! development; service binaries compose the pieces they need. Values are
//! trimmed, and empty strings are treated as unset.

use std::time::Duration;

use crate::error::{Error, Result};

/// HTTP listen configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Listen address, e.g. `0.0.0.0:8080`.
    pub address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".into(),
        }
    }
}

impl ApiConfig {
    /// Loads from `API_ADDRESS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(address) = env_string("API_ADDRESS") {
            config.address = address;
        }
        config
    }
}

/// Document store configuration.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Connection string. Empty selects the in-memory backend.
    pub uri: Option<String>,
    /// Logical database name.
    pub name: String,
}

impl DatabaseConfig {
    /// Loads from `DB_URI` / `DB_NAME`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            uri: env_string("DB_URI"),
            name: env_string("DB_NAME").unwrap_or_else(|| "iot".into()),
        }
    }
}

/// Device-configuration backend (NEF) client configuration.
#[derive(Debug, Clone, Default)]
pub struct NefConfig {
    /// Base URL of the backend. Empty selects the stub client.
    pub base_url: Option<String>,
}

impl NefConfig {
    /// Loads from `EASYAPI_BASE_URL`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("EASYAPI_BASE_URL"),
        }
    }
}

/// The power-saving profile applied to devices.
#[derive(Debug, Clone)]
pub struct PowerSavingConfig {
    /// Maximum latency value applied when power-saving is enabled.
    pub max_latency: String,
    /// Maximum response time value applied when power-saving is enabled.
    pub max_response_time: String,
}

impl Default for PowerSavingConfig {
    fn default() -> Self {
        Self {
            max_latency: "1".into(),
            max_response_time: "1".into(),
        }
    }
}

impl PowerSavingConfig {
    /// Loads from `POWERSAVING_MAX_LATENCY` / `POWERSAVING_MAX_RESPONSE_TIME`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(latency) = env_string("POWERSAVING_MAX_LATENCY") {
            config.max_latency = latency;
        }
        if let Some(response_time) = env_string("POWERSAVING_MAX_RESPONSE_TIME") {
            config.max_response_time = response_time;
        }
        config
    }
}

/// Retention policy for terminal transactions.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How long terminal transactions are kept after their last update.
    pub period: Duration,
    /// How often the cleanup job runs.
    pub cleanup_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(168 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl RetentionConfig {
    /// Loads from `RETENTION_PERIOD` / `RETENTION_CLEANUP_INTERVAL`
    /// (humantime strings, e.g. `168h`, `1h`).
    ///
    /// # Errors
    ///
    /// Returns an error when a value is present but unparseable.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(period) = env_duration("RETENTION_PERIOD")? {
            config.period = period;
        }
        if let Some(interval) = env_duration("RETENTION_CLEANUP_INTERVAL")? {
            config.cleanup_interval = interval;
        }
        Ok(config)
    }
}

/// Outbound HTTP client configuration.
#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// Skip TLS certificate verification for in-cluster sinks only.
    pub insecure_skip_verify: bool,
}

impl HttpClientConfig {
    /// Loads from `HTTP_INSECURE_SKIP_VERIFY`.
    ///
    /// # Errors
    ///
    /// Returns an error when the value is present but not a boolean.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            insecure_skip_verify: env_bool("HTTP_INSECURE_SKIP_VERIFY")?.unwrap_or(false),
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level filter when `RUST_LOG` is unset, e.g. `info`.
    pub level: String,
    /// `production` selects JSON output, anything else pretty output.
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "production".into(),
        }
    }
}

impl LogConfig {
    /// Loads from `LOG_LEVEL` / `LOG_FORMAT`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(level) = env_string("LOG_LEVEL") {
            config.level = level;
        }
        if let Some(format) = env_string("LOG_FORMAT") {
            config.format = format;
        }
        config
    }
}

/// Broker publish target.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// URL events are published to (Knative `K_SINK` contract).
    pub sink: Option<String>,
}

impl BrokerConfig {
    /// Loads from `K_SINK`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            sink: env_string("K_SINK"),
        }
    }

    /// Returns the sink URL or an error when unset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `K_SINK` is not set.
    pub fn require_sink(&self) -> Result<&str> {
        self.sink
            .as_deref()
            .ok_or_else(|| Error::config("missing broker URL: set via SinkBinding or K_SINK"))
    }
}

/// Reads a trimmed, non-empty environment string.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Reads a boolean environment variable (`true`/`false`/`1`/`0`/`yes`/`no`).
///
/// # Errors
///
/// Returns an error when the value is present but not a boolean.
pub fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(Some(true)),
        "false" | "0" | "no" | "n" => Ok(Some(false)),
        _ => Err(Error::config(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

/// Reads a `u16` environment variable.
///
/// # Errors
///
/// Returns an error when the value is present but unparseable.
pub fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::config(format!("{name} must be a u16: {e}")))
}

/// Reads a `usize` environment variable.
///
/// # Errors
///
/// Returns an error when the value is present but unparseable.
pub fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::config(format!("{name} must be a usize: {e}")))
}

/// Reads a humantime duration environment variable (e.g. `168h`, `90s`).
///
/// # Errors
///
/// Returns an error when the value is present but unparseable.
pub fn env_duration(name: &str) -> Result<Option<Duration>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    humantime::parse_duration(&v)
        .map(Some)
        .map_err(|e| Error::config(format!("{name} must be a duration such as '168h': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_defaults() {
        let config = RetentionConfig::default();
        assert_eq!(config.period, Duration::from_secs(168 * 3600));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
    }

    #[test]
    fn power_saving_defaults_to_ones() {
        let config = PowerSavingConfig::default();
        assert_eq!(config.max_latency, "1");
        assert_eq!(config.max_response_time, "1");
    }

    #[test]
    fn broker_requires_sink() {
        let config = BrokerConfig { sink: None };
        assert!(config.require_sink().is_err());

        let config = BrokerConfig {
            sink: Some("http://broker.svc/publish".into()),
        };
        assert_eq!(config.require_sink().unwrap(), "http://broker.svc/publish");
    }

    #[test]
    fn env_bool_parsing() {
        std::env::set_var("IOTNO_TEST_BOOL", "yes");
        assert_eq!(env_bool("IOTNO_TEST_BOOL").unwrap(), Some(true));
        std::env::set_var("IOTNO_TEST_BOOL", "maybe");
        assert!(env_bool("IOTNO_TEST_BOOL").is_err());
        std::env::remove_var("IOTNO_TEST_BOOL");
    }

    #[test]
    fn env_duration_parsing() {
        std::env::set_var("IOTNO_TEST_DURATION", "2h");
        assert_eq!(
            env_duration("IOTNO_TEST_DURATION").unwrap(),
            Some(Duration::from_secs(7200))
        );
        std::env::remove_var("IOTNO_TEST_DURATION");
    }
}
