//! Request and response bodies of the public HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use iotno_core::{Device, SubscriptionRequest};
use iotno_store::model::ActionState;

/// Body of `POST /features/power-saving`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerSavingRequest {
    /// Devices to reconfigure.
    pub devices: Vec<Device>,
    /// True applies power-saving at start; false restores at start.
    pub enabled: bool,
    /// Where completion and error callbacks go.
    pub subscription_request: SubscriptionRequest,
    /// Optional scheduling window; absent means "now, no end".
    #[serde(default)]
    pub time_period: Option<TimePeriod>,
}

/// The scheduling window of a request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePeriod {
    /// When the start phase fires.
    pub start_date: DateTime<Utc>,
    /// When the end phase fires, if scheduled.
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

/// Per-device entry of the activation status list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// The device as originally supplied.
    pub device: Device,
    /// Projected status.
    pub status: ActionState,
}

/// Body of the 202 submit response and the status-query response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerSavingResponse {
    /// The transaction handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Per-device status list (query responses only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_status: Option<Vec<DeviceStatus>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_minimal_body() {
        let body = serde_json::json!({
            "devices": [{"phoneNumber": "+11111"}],
            "enabled": true,
            "subscriptionRequest": {
                "protocol": "HTTP",
                "sink": "http://cb",
                "types": [
                    "org.camaraproject.iot-network-optimization-notification.v1.power-saving",
                    "org.camaraproject.iot-network-optimization-notification.v1.power-saving.error"
                ]
            }
        });

        let request: PowerSavingRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.devices.len(), 1);
        assert!(request.enabled);
        assert!(request.time_period.is_none());
    }

    #[test]
    fn time_period_parses_with_optional_end() {
        let body = serde_json::json!({
            "startDate": "2026-08-01T10:00:00Z"
        });
        let period: TimePeriod = serde_json::from_value(body).unwrap();
        assert!(period.end_date.is_none());
    }

    #[test]
    fn submit_response_omits_activation_status() {
        let response = PowerSavingResponse {
            transaction_id: Some("abc".into()),
            activation_status: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("activationStatus"));
    }
}
