//! Logging initialization shared by all service binaries.
//!
//! Structured logging via `tracing` with consistent fields across services.
//! Production deployments emit JSON; local development gets pretty output.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Maps the `LOG_FORMAT` configuration value to a format.
    #[must_use]
    pub fn from_config(config: &LogConfig) -> Self {
        if config.format.eq_ignore_ascii_case("production") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at service startup. Safe to call multiple times; subsequent
/// calls are no-ops. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LogConfig) {
    let format = LogFormat::from_config(config);
    let default_filter = config.level.clone();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LogConfig::default();
        init_logging(&config);
        init_logging(&config);
    }

    #[test]
    fn production_format_maps_to_json() {
        let config = LogConfig {
            level: "info".into(),
            format: "production".into(),
        };
        assert!(matches!(LogFormat::from_config(&config), LogFormat::Json));

        let config = LogConfig {
            level: "debug".into(),
            format: "console".into(),
        };
        assert!(matches!(LogFormat::from_config(&config), LogFormat::Pretty));
    }
}
