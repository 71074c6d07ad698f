//! Device identifiers and canonical-identifier resolution.
//!
//! A [`Device`] is a product of four optional identifier fields, mirroring
//! the CAMARA device schema. Internally every device is tracked by exactly
//! one canonical [`NetworkAccessIdentifier`] (NAI), derived by a pluggable
//! [`NaiResolver`].
//!
//! The default [`HashingResolver`] produces a deterministic surrogate when no
//! NAI is supplied: the identifier payload is canonicalized (sorted JSON
//! keys), SHA-256 hashed, and the first 16 hex characters form
//! `<hex16>@generated.nai`. Deployments with access to a subscriber database
//! substitute a real lookup behind the same trait.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Canonical device identifier, used as the per-device primary key across
/// transactions and original-state documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkAccessIdentifier(String);

impl NetworkAccessIdentifier {
    /// Wraps a raw NAI string.
    #[must_use]
    pub fn new(nai: impl Into<String>) -> Self {
        Self(nai.into())
    }

    /// Returns the NAI as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkAccessIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// IPv4 address block of a device identifier.
///
/// The public address is the NAT'd address seen by the network; the optional
/// private address and public port narrow it to a single subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIpv4Addr {
    /// Publicly observable IPv4 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    /// Private IPv4 address behind NAT.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,
    /// Public port associated with the public address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
}

/// A device as supplied by the API consumer.
///
/// At least one identifier field must be present. After admission, the
/// resolved `network_access_identifier` is always populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Subscriber phone number in E.164 format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// IPv4 address identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<DeviceIpv4Addr>,
    /// IPv6 address identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
    /// Pre-resolved canonical identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_access_identifier: Option<NetworkAccessIdentifier>,
}

impl Device {
    /// Returns true when no identifier field is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phone_number.is_none()
            && self.ipv4_address.is_none()
            && self.ipv6_address.is_none()
            && self.network_access_identifier.is_none()
    }

    /// Convenience constructor for a phone-number-only device.
    #[must_use]
    pub fn from_phone_number(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: Some(phone_number.into()),
            ..Self::default()
        }
    }
}

/// Resolves a device's identifiers to a canonical NAI.
///
/// Implementations may consult a subscriber database; the default
/// [`HashingResolver`] derives a deterministic surrogate.
pub trait NaiResolver: Send + Sync {
    /// Resolves `device` to its canonical network access identifier.
    ///
    /// # Errors
    ///
    /// Returns an error when the device carries no usable identifier.
    fn resolve(&self, device: &Device) -> Result<NetworkAccessIdentifier>;
}

/// Deterministic hash-based resolver.
///
/// Uses the supplied NAI verbatim when present; otherwise hashes the
/// canonicalized identifier payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashingResolver;

impl HashingResolver {
    /// Creates a new hashing resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn hash_identifiers(device: &Device) -> Result<NetworkAccessIdentifier> {
        // serde_json maps are key-sorted, which gives us the lexicographic
        // canonical form the surrogate derivation requires.
        let mut payload = serde_json::Map::new();

        if let Some(phone) = device.phone_number.as_deref().filter(|p| !p.is_empty()) {
            payload.insert("phoneNumber".into(), serde_json::Value::String(phone.into()));
        }
        if let Some(ipv4) = &device.ipv4_address {
            payload.insert("ipv4Address".into(), serde_json::to_value(ipv4)?);
        }
        if let Some(ipv6) = device.ipv6_address.as_deref().filter(|a| !a.is_empty()) {
            payload.insert("ipv6Address".into(), serde_json::Value::String(ipv6.into()));
        }

        if payload.is_empty() {
            return Err(Error::validation(
                "device has no identifier to resolve a network access identifier from",
            ));
        }

        let canonical = serde_json::to_vec(&serde_json::Value::Object(payload))?;
        let digest = Sha256::digest(&canonical);
        let hex = hex_encode(&digest);

        Ok(NetworkAccessIdentifier::new(format!(
            "{}@generated.nai",
            &hex[..16]
        )))
    }
}

impl NaiResolver for HashingResolver {
    fn resolve(&self, device: &Device) -> Result<NetworkAccessIdentifier> {
        if let Some(nai) = &device.network_access_identifier {
            if !nai.as_str().is_empty() {
                tracing::debug!(nai = %nai, "using supplied network access identifier");
                return Ok(nai.clone());
            }
        }

        let nai = Self::hash_identifiers(device)?;
        tracing::debug!(
            nai = %nai,
            has_phone_number = device.phone_number.is_some(),
            has_ipv4 = device.ipv4_address.is_some(),
            has_ipv6 = device.ipv6_address.is_some(),
            "derived surrogate network access identifier"
        );
        Ok(nai)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supplied_nai_is_used_verbatim() {
        let device = Device {
            phone_number: Some("+393331234567".into()),
            network_access_identifier: Some(NetworkAccessIdentifier::new("ue1@operator.example")),
            ..Device::default()
        };

        let nai = HashingResolver::new().resolve(&device).unwrap();
        assert_eq!(nai.as_str(), "ue1@operator.example");
    }

    #[test]
    fn surrogate_is_deterministic() {
        let device = Device::from_phone_number("+393331234567");
        let resolver = HashingResolver::new();

        let first = resolver.resolve(&device).unwrap();
        let second = resolver.resolve(&device).unwrap();

        assert_eq!(first, second);
        assert!(first.as_str().ends_with("@generated.nai"));
        assert_eq!(first.as_str().len(), 16 + "@generated.nai".len());
    }

    #[test]
    fn different_identifiers_produce_different_surrogates() {
        let resolver = HashingResolver::new();
        let a = resolver
            .resolve(&Device::from_phone_number("+11111"))
            .unwrap();
        let b = resolver
            .resolve(&Device::from_phone_number("+22222"))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn ipv4_identifier_resolves() {
        let device = Device {
            ipv4_address: Some(DeviceIpv4Addr {
                public_address: Some("203.0.113.7".into()),
                private_address: None,
                public_port: Some(8443),
            }),
            ..Device::default()
        };

        let nai = HashingResolver::new().resolve(&device).unwrap();
        assert!(nai.as_str().ends_with("@generated.nai"));
    }

    #[test]
    fn empty_device_is_rejected() {
        let err = HashingResolver::new().resolve(&Device::default()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
