//! Syntactic validation of incoming requests.
//!
//! Format checks only: identifier resolution, restore preconditions, and
//! conflict detection live in the submit handler where the store is at hand.

use std::net::IpAddr;

use iotno_core::{Device, Error, Result};

use crate::models::PowerSavingRequest;

fn validate_ipv4(address: &str) -> Result<()> {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok(()),
        Ok(IpAddr::V6(_)) => Err(Error::validation("not a valid IPv4 address")),
        Err(_) => Err(Error::validation("invalid IP address format")),
    }
}

fn validate_ipv6(address: &str) -> Result<()> {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => Ok(()),
        Ok(IpAddr::V4(_)) => Err(Error::validation("not a valid IPv6 address")),
        Err(_) => Err(Error::validation("invalid IP address format")),
    }
}

fn validate_device(device: &Device) -> Result<()> {
    if let Some(ipv4) = &device.ipv4_address {
        if let Some(public) = ipv4.public_address.as_deref() {
            validate_ipv4(public)
                .map_err(|e| Error::validation(format!("invalid publicAddress: {e}")))?;
        }
        if let Some(private) = ipv4.private_address.as_deref() {
            validate_ipv4(private)
                .map_err(|e| Error::validation(format!("invalid privateAddress: {e}")))?;
        }
    }

    if let Some(ipv6) = device.ipv6_address.as_deref() {
        validate_ipv6(ipv6).map_err(|e| Error::validation(format!("invalid ipv6Address: {e}")))?;
    }

    Ok(())
}

/// Validates the shape of a power-saving request.
///
/// # Errors
///
/// Returns a validation error naming the first offending field.
pub fn validate_request(request: &PowerSavingRequest) -> Result<()> {
    if request.devices.is_empty() {
        return Err(Error::validation("devices list cannot be empty"));
    }

    for (index, device) in request.devices.iter().enumerate() {
        validate_device(device)
            .map_err(|e| Error::validation(format!("device at index {index}: {e}")))?;
    }

    request.subscription_request.validate_protocol()?;
    request.subscription_request.validate_types()?;

    if let Some(credential) = &request.subscription_request.sink_credential {
        credential.validate()?;
    }

    Ok(())
}
