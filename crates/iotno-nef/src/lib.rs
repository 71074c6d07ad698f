//! # iotno-nef
//!
//! Client for the downstream device-configuration backend.
//!
//! The worker speaks to the backend through the [`NefClient`] trait:
//! `get_device_config` reads the current communication characteristics and
//! `set_device_config` writes them. [`http::HttpNefClient`] maps the
//! contract onto the 3GPP UDM endpoints; [`StubNefClient`] answers with
//! fixed values for integration tests and deployments without a configured
//! backend.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use iotno_core::Device;

/// The result type used by NEF operations.
pub type Result<T> = std::result::Result<T, NefError>;

/// Errors surfaced by the device-configuration backend.
#[derive(Debug, thiserror::Error)]
pub enum NefError {
    /// The device carries no usable identifier for the backend.
    #[error("device has no network access identifier")]
    MissingIdentifier,

    /// The backend answered with an unexpected status.
    #[error("backend returned status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status returned.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// A required field was missing from the backend response.
    #[error("missing required field in backend response: {field}")]
    MissingField {
        /// The missing field name.
        field: &'static str,
    },

    /// The request itself failed (connection, timeout, serialization).
    #[error("backend request failed: {message}")]
    Request {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// A device's communication characteristics.
///
/// The two values are opaque numeric strings: captured verbatim from the
/// backend and written back verbatim on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Maximum latency.
    pub max_latency: String,
    /// Maximum response time.
    pub max_response_time: String,
}

/// Client contract for the device-configuration backend.
#[async_trait]
pub trait NefClient: Send + Sync {
    /// Retrieves the device's current configuration.
    async fn get_device_config(&self, device: &Device) -> Result<DeviceConfig>;

    /// Applies a configuration to the device.
    async fn set_device_config(&self, device: &Device, config: &DeviceConfig) -> Result<()>;
}

/// Stub client used when no backend URL is configured.
///
/// Reads return fixed non-power-saving values; writes are accepted and
/// logged. Integration tests rely on the fixed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubNefClient;

impl StubNefClient {
    /// Creates a stub client.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NefClient for StubNefClient {
    async fn get_device_config(&self, device: &Device) -> Result<DeviceConfig> {
        let config = DeviceConfig {
            max_latency: "100".into(),
            max_response_time: "200".into(),
        };
        tracing::info!(device = ?device, config = ?config, "stub: returning device configuration");
        Ok(config)
    }

    async fn set_device_config(&self, device: &Device, config: &DeviceConfig) -> Result<()> {
        tracing::info!(
            device = ?device,
            max_latency = %config.max_latency,
            max_response_time = %config.max_response_time,
            "stub: applied device configuration"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_returns_fixed_values() {
        let client = StubNefClient::new();
        let device = Device::from_phone_number("+11111");

        let config = client.get_device_config(&device).await.unwrap();
        assert_eq!(config.max_latency, "100");
        assert_eq!(config.max_response_time, "200");

        client.set_device_config(&device, &config).await.unwrap();
    }
}
