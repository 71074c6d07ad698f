//! Subscription requests and sink credentials.
//!
//! The subscription request rides along every event so that whichever
//! service ends up delivering the callback has the sink and credential at
//! hand without a store read.
//!
//! `SinkCredential` is polymorphic upstream (discriminated by
//! `credentialType`); only the `ACCESSTOKEN` variant is implemented and the
//! others are rejected at admission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Event type URN delivered on successful phase completion.
pub const SUBSCRIPTION_TYPE_POWER_SAVING: &str =
    "org.camaraproject.iot-network-optimization-notification.v1.power-saving";

/// Event type URN delivered on processing errors.
pub const SUBSCRIPTION_TYPE_POWER_SAVING_ERROR: &str =
    "org.camaraproject.iot-network-optimization-notification.v1.power-saving.error";

/// Delivery protocol for subscription callbacks. Only HTTP is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// HTTP callback delivery.
    #[serde(rename = "HTTP")]
    Http,
    /// MQTT delivery (declared upstream, not implemented).
    #[serde(rename = "MQTT3")]
    Mqtt3,
    /// MQTT v5 delivery (declared upstream, not implemented).
    #[serde(rename = "MQTT5")]
    Mqtt5,
}

/// Credential discriminator. Only `ACCESSTOKEN` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CredentialType {
    /// Access-token credential (bearer).
    Accesstoken,
    /// Plain username/password credential (not implemented).
    Plain,
    /// Refresh-token credential (not implemented).
    Refreshtoken,
}

/// A sink credential authorizing callback delivery to the subscriber sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkCredential {
    /// Discriminator; must be `ACCESSTOKEN`.
    pub credential_type: CredentialType,
    /// The access token value.
    #[serde(default)]
    pub access_token: String,
    /// Token expiry timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_expires_utc: Option<DateTime<Utc>>,
    /// Token scheme; `bearer` enables the Authorization header.
    #[serde(default)]
    pub access_token_type: String,
}

impl SinkCredential {
    /// Validates that the credential variant is implemented.
    ///
    /// # Errors
    ///
    /// Returns a validation error for any variant other than `ACCESSTOKEN`.
    pub fn validate(&self) -> Result<()> {
        if self.credential_type != CredentialType::Accesstoken {
            return Err(Error::validation(format!(
                "sink credential type {:?} not implemented (only ACCESSTOKEN supported)",
                self.credential_type
            )));
        }
        Ok(())
    }

    /// Builds the `Authorization` header value, when the credential allows it.
    #[must_use]
    pub fn authorization_header(&self) -> Option<String> {
        if self.credential_type != CredentialType::Accesstoken {
            return None;
        }
        if self.access_token.is_empty() || self.access_token_type != "bearer" {
            return None;
        }
        Some(format!("Bearer {}", self.access_token))
    }
}

/// The subscription half of a power-saving request: where and how completion
/// and error callbacks are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Delivery protocol; must be `HTTP`.
    pub protocol: Protocol,
    /// The address events shall be delivered to.
    pub sink: String,
    /// Optional credential for the sink.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_credential: Option<SinkCredential>,
    /// Declared event types for this subscription.
    pub types: Vec<String>,
}

impl SubscriptionRequest {
    /// Validates the delivery protocol.
    ///
    /// # Errors
    ///
    /// Returns a validation error for any protocol other than HTTP.
    pub fn validate_protocol(&self) -> Result<()> {
        if self.protocol != Protocol::Http {
            return Err(Error::validation(format!(
                "subscription protocol {:?} not implemented; only HTTP supported",
                self.protocol
            )));
        }
        Ok(())
    }

    /// Validates that the declared types are exactly the completion and
    /// error event types.
    ///
    /// # Errors
    ///
    /// Returns a validation error when either type is missing or extra types
    /// are present.
    pub fn validate_types(&self) -> Result<()> {
        if self.types.len() != 2 {
            return Err(Error::validation(format!(
                "subscription types must contain exactly '{SUBSCRIPTION_TYPE_POWER_SAVING}' and \
                 '{SUBSCRIPTION_TYPE_POWER_SAVING_ERROR}', got {} types",
                self.types.len()
            )));
        }

        let has_completion = self
            .types
            .iter()
            .any(|t| t == SUBSCRIPTION_TYPE_POWER_SAVING);
        let has_error = self
            .types
            .iter()
            .any(|t| t == SUBSCRIPTION_TYPE_POWER_SAVING_ERROR);

        if !has_completion || !has_error {
            return Err(Error::validation(format!(
                "subscription types must contain both '{SUBSCRIPTION_TYPE_POWER_SAVING}' and \
                 '{SUBSCRIPTION_TYPE_POWER_SAVING_ERROR}'"
            )));
        }

        Ok(())
    }
}
