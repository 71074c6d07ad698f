//! HTTP NEF client mapping the contract onto the 3GPP UDM endpoints.
//!
//! - Read: `GET /nudm-sdm/v2/{supi}/am-data`, mapping `subsRegTimer` to
//!   `maxLatency` and `activeTime` to `maxResponseTime`. Either field
//!   missing is an error.
//! - Write: `PATCH /nudm-pp/v1/{ueId}/pp-data` with the communication
//!   characteristics; the backend answers 204 on success.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use iotno_core::Device;

use crate::{DeviceConfig, NefClient, NefError, Result};

/// Access and mobility subscription data subset (3GPP TS 29.503).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AmData {
    subs_reg_timer: Option<i64>,
    active_time: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PpDataUpdate<'a> {
    pp_data: PpDataPayload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PpDataPayload<'a> {
    communication_characteristics: CommunicationCharacteristics<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommunicationCharacteristics<'a> {
    pp_maximum_latency: &'a str,
    pp_maximum_response_time: &'a str,
}

/// HTTP client for the device-configuration backend.
#[derive(Debug, Clone)]
pub struct HttpNefClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpNefClient {
    /// Creates a client for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NefError::Request {
                message: "failed to build HTTP client".into(),
                source: Some(Box::new(e)),
            })?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn supi(device: &Device) -> Result<&str> {
        device
            .network_access_identifier
            .as_ref()
            .map(iotno_core::NetworkAccessIdentifier::as_str)
            .ok_or(NefError::MissingIdentifier)
    }
}

fn request_err(message: impl Into<String>, err: reqwest::Error) -> NefError {
    NefError::Request {
        message: message.into(),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl NefClient for HttpNefClient {
    async fn get_device_config(&self, device: &Device) -> Result<DeviceConfig> {
        let supi = Self::supi(device)?;
        let url = format!("{}/nudm-sdm/v2/{}/am-data", self.base_url, urlencode(supi));

        tracing::debug!(supi = %supi, url = %url, "reading device am-data");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| request_err("am-data request failed", e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(NefError::UnexpectedStatus {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let am_data: AmData = response
            .json()
            .await
            .map_err(|e| request_err("am-data response parse failed", e))?;

        let max_latency = am_data
            .subs_reg_timer
            .ok_or(NefError::MissingField {
                field: "subsRegTimer",
            })?
            .to_string();
        let max_response_time = am_data
            .active_time
            .ok_or(NefError::MissingField {
                field: "activeTime",
            })?
            .to_string();

        let config = DeviceConfig {
            max_latency,
            max_response_time,
        };
        tracing::debug!(supi = %supi, config = ?config, "mapped am-data to device config");
        Ok(config)
    }

    async fn set_device_config(&self, device: &Device, config: &DeviceConfig) -> Result<()> {
        let ue_id = Self::supi(device)?;
        let url = format!("{}/nudm-pp/v1/{}/pp-data", self.base_url, urlencode(ue_id));

        tracing::debug!(ue_id = %ue_id, url = %url, config = ?config, "writing device pp-data");

        let body = PpDataUpdate {
            pp_data: PpDataPayload {
                communication_characteristics: CommunicationCharacteristics {
                    pp_maximum_latency: &config.max_latency,
                    pp_maximum_response_time: &config.max_response_time,
                },
            },
        };

        let response = self
            .client
            .patch(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| request_err("pp-data request failed", e))?;

        let status = response.status();
        if status != reqwest::StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            return Err(NefError::UnexpectedStatus {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        tracing::debug!(ue_id = %ue_id, "device configuration updated");
        Ok(())
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        body.to_string()
    } else {
        body.chars().take(MAX).collect()
    }
}

fn urlencode(segment: &str) -> String {
    // Path-segment escaping for the NAI, which may contain '@'.
    segment
        .bytes()
        .map(|b| match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                char::from(b).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, patch};
    use axum::{Json, Router};

    #[test]
    fn nai_path_segment_is_escaped() {
        assert_eq!(urlencode("abc123"), "abc123");
        assert_eq!(urlencode("ue@generated.nai"), "ue%40generated.nai");
    }

    async fn spawn_backend(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn device() -> Device {
        Device {
            network_access_identifier: Some(iotno_core::NetworkAccessIdentifier::new(
                "ue1@generated.nai",
            )),
            ..Device::default()
        }
    }

    #[tokio::test]
    async fn get_maps_am_data_fields() {
        let router = Router::new().route(
            "/nudm-sdm/v2/{supi}/am-data",
            get(|Path(supi): Path<String>| async move {
                assert_eq!(supi, "ue1@generated.nai");
                Json(serde_json::json!({"subsRegTimer": 100, "activeTime": 200}))
            }),
        );
        let base = spawn_backend(router).await;

        let client = HttpNefClient::new(base).unwrap();
        let config = client.get_device_config(&device()).await.unwrap();
        assert_eq!(config.max_latency, "100");
        assert_eq!(config.max_response_time, "200");
    }

    #[tokio::test]
    async fn get_rejects_missing_fields() {
        let router = Router::new().route(
            "/nudm-sdm/v2/{supi}/am-data",
            get(|| async { Json(serde_json::json!({"subsRegTimer": 100})) }),
        );
        let base = spawn_backend(router).await;

        let client = HttpNefClient::new(base).unwrap();
        let err = client.get_device_config(&device()).await.unwrap_err();
        assert!(matches!(
            err,
            NefError::MissingField {
                field: "activeTime"
            }
        ));
    }

    #[tokio::test]
    async fn set_sends_pp_data_and_expects_204() {
        let bodies: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&bodies);

        let router = Router::new().route(
            "/nudm-pp/v1/{ue_id}/pp-data",
            patch(move |Json(body): Json<serde_json::Value>| {
                let captured = Arc::clone(&captured);
                async move {
                    captured.lock().unwrap().push(body);
                    StatusCode::NO_CONTENT
                }
            }),
        );
        let base = spawn_backend(router).await;

        let client = HttpNefClient::new(base).unwrap();
        client
            .set_device_config(
                &device(),
                &DeviceConfig {
                    max_latency: "1".into(),
                    max_response_time: "1".into(),
                },
            )
            .await
            .unwrap();

        let bodies = bodies.lock().unwrap();
        assert_eq!(
            bodies[0]["ppData"]["communicationCharacteristics"]["ppMaximumLatency"],
            "1"
        );
    }

    #[tokio::test]
    async fn set_rejects_unexpected_status() {
        let router = Router::new().route(
            "/nudm-pp/v1/{ue_id}/pp-data",
            patch(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = spawn_backend(router).await;

        let client = HttpNefClient::new(base).unwrap();
        let err = client
            .set_device_config(
                &device(),
                &DeviceConfig {
                    max_latency: "1".into(),
                    max_response_time: "1".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NefError::UnexpectedStatus { status: 500, .. }));
    }
}
