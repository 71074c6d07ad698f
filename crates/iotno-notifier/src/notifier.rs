//! Callback construction and delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;

use iotno_bus::{BusError, EventHandler};
use iotno_core::config::HttpClientConfig;
use iotno_core::event::{AllDevicesCompletedData, ErrorNotificationData, EventEnvelope};
use iotno_core::subscription::{
    SUBSCRIPTION_TYPE_POWER_SAVING, SUBSCRIPTION_TYPE_POWER_SAVING_ERROR, SubscriptionRequest,
};
use iotno_core::{Device, EventType, TransactionId};
use iotno_store::Store;
use iotno_store::model::ActionState;

/// Content type of the callbacks posted to the sink.
const CLOUDEVENTS_CONTENT_TYPE: &str = "application/cloudevents+json";

/// `CloudEvents` envelope delivered to the subscriber sink.
#[derive(Debug, Serialize)]
struct NotificationEnvelope<T: Serialize> {
    id: String,
    source: &'static str,
    specversion: &'static str,
    #[serde(rename = "type")]
    event_type: &'static str,
    time: DateTime<Utc>,
    datacontenttype: &'static str,
    data: T,
}

impl<T: Serialize> NotificationEnvelope<T> {
    fn new(id: String, source: &'static str, event_type: &'static str, data: T) -> Self {
        Self {
            id,
            source,
            specversion: "1.0",
            event_type,
            time: Utc::now(),
            datacontenttype: "application/json",
            data,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceCallbackStatus {
    device: Device,
    status: ActionState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionPayload {
    transaction_id: TransactionId,
    activation_status: Vec<DeviceCallbackStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload {
    transaction_id: TransactionId,
    status: u16,
    code: String,
    message: String,
}

/// The notification delivery service.
pub struct NotificationWorker {
    store: Arc<dyn Store>,
    config: HttpClientConfig,
}

impl NotificationWorker {
    /// Creates a notification worker.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: HttpClientConfig) -> Self {
        if config.insecure_skip_verify {
            tracing::warn!(
                "HTTP_INSECURE_SKIP_VERIFY enabled - TLS verification disabled for in-cluster sinks"
            );
        }
        Self { store, config }
    }

    /// Builds an HTTP client for the given sink.
    ///
    /// In-cluster sinks (`*.svc`, `*.svc.cluster.local`, or a `.svc.` label)
    /// may skip TLS verification when configured; everything else uses the
    /// system trust store.
    fn client_for_sink(&self, sink: &str) -> Result<reqwest::Client, BusError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));

        if is_in_cluster_sink(sink) {
            tracing::debug!(
                sink = %sink,
                insecure_skip_verify = self.config.insecure_skip_verify,
                "detected in-cluster sink"
            );
            builder = builder.danger_accept_invalid_certs(self.config.insecure_skip_verify);
        }

        builder.build().map_err(|e| BusError::Handler {
            message: "failed to build HTTP client".into(),
            source: Some(Box::new(e)),
        })
    }

    async fn handle_all_devices_completed(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<(), BusError> {
        let data: AllDevicesCompletedData = envelope
            .data_as()
            .map_err(|e| BusError::handler_with_source("parse completion event data", e))?;

        if data.subscription_request.sink.is_empty() {
            tracing::warn!(
                transaction_id = %data.transaction_id,
                "no notification sink configured, skipping notification"
            );
            return Ok(());
        }

        tracing::info!(
            transaction_id = %data.transaction_id,
            action = %data.action,
            "sending callback notification for action completion"
        );

        let transaction = self
            .store
            .get_transaction(data.transaction_id)
            .await
            .map_err(|e| BusError::handler_with_source("get transaction devices", e))?
            .ok_or_else(|| {
                BusError::handler(format!("transaction not found: {}", data.transaction_id))
            })?;

        let activation_status = transaction
            .devices
            .iter()
            .map(|device| DeviceCallbackStatus {
                device: device.device.clone(),
                status: device.phase_status(data.action),
            })
            .collect();

        let callback = NotificationEnvelope::new(
            format!("{}-{}", data.transaction_id, data.action),
            "urn:tim:iot-api",
            SUBSCRIPTION_TYPE_POWER_SAVING,
            CompletionPayload {
                transaction_id: data.transaction_id,
                activation_status,
            },
        );

        self.deliver(&data.subscription_request, &callback, "completion")
            .await;
        Ok(())
    }

    async fn handle_error_notification(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let data: ErrorNotificationData = envelope
            .data_as()
            .map_err(|e| BusError::handler_with_source("parse error event data", e))?;

        if data.subscription_request.sink.is_empty() {
            tracing::warn!(
                transaction_id = %data.transaction_id,
                "no notification sink configured, skipping error notification"
            );
            return Ok(());
        }

        tracing::info!(
            transaction_id = %data.transaction_id,
            error_code = %data.code,
            action = ?data.action,
            "sending error notification callback"
        );

        let callback = NotificationEnvelope::new(
            format!("{}-error", data.transaction_id),
            "urn:tim:iot-notify",
            SUBSCRIPTION_TYPE_POWER_SAVING_ERROR,
            ErrorPayload {
                transaction_id: data.transaction_id,
                status: data.status,
                code: data.code,
                message: data.message,
            },
        );

        self.deliver(&data.subscription_request, &callback, "error")
            .await;
        Ok(())
    }

    /// Posts the callback and classifies the response. Never propagates a
    /// delivery failure: the broker governs any retry, and most failures are
    /// the subscriber's to fix.
    async fn deliver<T: Serialize>(
        &self,
        subscription: &SubscriptionRequest,
        callback: &NotificationEnvelope<T>,
        kind: &'static str,
    ) {
        let sink = &subscription.sink;
        let client = match self.client_for_sink(sink) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(sink = %sink, error = %e, "failed to build sink client");
                return;
            }
        };

        let mut request = client
            .post(sink)
            .header(reqwest::header::CONTENT_TYPE, CLOUDEVENTS_CONTENT_TYPE)
            .json(callback);

        if let Some(header) = subscription
            .sink_credential
            .as_ref()
            .and_then(iotno_core::SinkCredential::authorization_header)
        {
            request = request.header(reqwest::header::AUTHORIZATION, header);
            tracing::debug!("added authorization header");
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(sink = %sink, error = %e, "failed to send callback notification");
                counter!("iotno_notifier_deliveries_total", "kind" => kind, "result" => "error")
                    .increment(1);
                return;
            }
        };

        let status = response.status();
        let result = match status.as_u16() {
            200 | 202 | 204 => {
                tracing::info!(sink = %sink, status = status.as_u16(), "callback delivered");
                "delivered"
            }
            410 => {
                tracing::warn!(sink = %sink, "callback endpoint is gone (410), notification discarded");
                "gone"
            }
            429 => {
                tracing::warn!(sink = %sink, "sink throttling (429), notification not retried");
                "throttled"
            }
            500..=599 => {
                tracing::warn!(sink = %sink, status = status.as_u16(), "sink server error");
                "server_error"
            }
            _ => {
                tracing::warn!(sink = %sink, status = status.as_u16(), "sink rejected callback");
                "rejected"
            }
        };
        counter!("iotno_notifier_deliveries_total", "kind" => kind, "result" => result)
            .increment(1);
    }
}

#[async_trait]
impl EventHandler for NotificationWorker {
    async fn handle(&self, envelope: EventEnvelope) -> Result<(), BusError> {
        match envelope.event_type {
            EventType::AllDevicesCompleted => self.handle_all_devices_completed(&envelope).await,
            EventType::PowerSavingError => self.handle_error_notification(&envelope).await,
            other => {
                tracing::warn!(event_type = %other, "unknown event type received");
                Ok(())
            }
        }
    }
}

/// Returns true when the sink hostname names an in-cluster service.
fn is_in_cluster_sink(sink: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(sink) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    host.ends_with(".svc.cluster.local") || host.ends_with(".svc") || host.contains(".svc.")
}
