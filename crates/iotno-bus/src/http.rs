//! HTTP `CloudEvents` transport.
//!
//! In a Knative-style deployment every service publishes through the
//! injected `K_SINK` URL and receives its subscription's deliveries as HTTP
//! POSTs. [`HttpSender`] implements the publish side; [`serve_receiver`]
//! runs the delivery side and maps handler failures to non-2xx responses so
//! the broker redelivers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use iotno_core::EventEnvelope;

use crate::{BusError, EventHandler, EventSender, Result};

/// Content type for structured-mode `CloudEvents` over HTTP.
pub const CLOUDEVENTS_CONTENT_TYPE: &str = "application/cloudevents+json";

/// Publishes envelopes to the broker's ingest URL.
#[derive(Debug, Clone)]
pub struct HttpSender {
    target: String,
    client: reqwest::Client,
}

impl HttpSender {
    /// Creates a sender targeting the given publish URL.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(target: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BusError::Publish {
                message: "failed to build HTTP client".into(),
                source: Some(Box::new(e)),
            })?;

        Ok(Self {
            target: target.into(),
            client,
        })
    }
}

#[async_trait]
impl EventSender for HttpSender {
    async fn send(&self, envelope: EventEnvelope) -> Result<()> {
        tracing::debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            target = %self.target,
            "publishing event"
        );

        let response = self
            .client
            .post(&self.target)
            .header(reqwest::header::CONTENT_TYPE, CLOUDEVENTS_CONTENT_TYPE)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| BusError::Publish {
                message: format!("publish to {} failed", self.target),
                source: Some(Box::new(e)),
            })?;

        if !response.status().is_success() {
            return Err(BusError::publish(format!(
                "broker returned status {} for event {}",
                response.status(),
                envelope.id
            )));
        }

        Ok(())
    }
}

async fn receive(
    State(handler): State<Arc<dyn EventHandler>>,
    Json(envelope): Json<EventEnvelope>,
) -> StatusCode {
    let event_id = envelope.id.clone();
    let event_type = envelope.event_type;

    match handler.handle(envelope).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "event handling failed, signalling redelivery"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Builds the delivery router for a handler (exposed for tests).
///
/// `/healthz` answers probes without touching the handler.
#[must_use]
pub fn receiver_router(handler: Arc<dyn EventHandler>) -> Router {
    Router::new()
        .route("/", post(receive))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(handler)
}

/// Runs the delivery server until the listener fails.
///
/// # Errors
///
/// Returns an error when binding or serving fails.
pub async fn serve_receiver(address: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|e| BusError::Config {
            message: format!("failed to bind receiver on {address}: {e}"),
        })?;

    tracing::info!(address = %address, "event receiver listening");

    axum::serve(listener, receiver_router(handler))
        .await
        .map_err(|e| BusError::Config {
            message: format!("receiver server failed: {e}"),
        })
}
