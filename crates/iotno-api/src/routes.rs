//! HTTP handlers for the admission API.

use std::collections::HashSet;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use chrono::Utc;

use iotno_bus::EventSender;
use iotno_core::event::{EventEnvelope, PowerSavingPayload, ScheduleRequestedData};
use iotno_core::{EventSource, EventType, NaiResolver, TransactionId};
use iotno_store::Store;

use crate::auth::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::models::{DeviceStatus, PowerSavingRequest, PowerSavingResponse};
use crate::server::AppState;
use crate::validation::validate_request;

/// `POST /features/power-saving`.
///
/// Validates the request, resolves device identifiers, checks the restore
/// precondition and device conflicts, then publishes `schedule.requested`
/// and answers 202 with the allocated transaction ID. The scheduler, not
/// this handler, materializes the transaction row.
pub async fn activate_power_saving(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<PowerSavingRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PowerSavingResponse>)> {
    let Json(mut request) = payload.map_err(|e| {
        tracing::warn!(error = %e, "failed to bind request body");
        ApiError::invalid_argument("invalid request body")
    })?;

    validate_request(&request)?;

    // Resolve every device to its canonical NAI and reject duplicates.
    let mut device_ids = Vec::with_capacity(request.devices.len());
    let mut seen = HashSet::new();
    for (index, device) in request.devices.iter_mut().enumerate() {
        let nai = state.resolver.resolve(device).map_err(|e| {
            ApiError::invalid_argument(format!(
                "failed to resolve device identifier at index {index}: {e}"
            ))
        })?;

        if !seen.insert(nai.clone()) {
            return Err(ApiError::invalid_argument(format!(
                "duplicate device in request: {nai}"
            )));
        }

        device.network_access_identifier = Some(nai.clone());
        device_ids.push(nai);
    }

    // Restoring requires a captured original for every device.
    if !request.enabled {
        let missing = state
            .store
            .missing_original_states(&device_ids)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to check device configurations");
                ApiError::internal("failed to verify device configurations")
            })?;

        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|d| d.as_str()).collect();
            tracing::warn!(missing = ?names, "restore requested without stored configuration");
            return Err(ApiError::invalid_argument(format!(
                "cannot disable power-saving: no stored configuration for devices: {names:?}"
            )));
        }
    }

    // A device may appear in at most one in-flight transaction.
    let conflicts = state
        .store
        .find_device_conflicts(&device_ids)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to check device conflicts");
            ApiError::internal("failed to check device availability")
        })?;

    if !conflicts.is_empty() {
        let ids: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
        tracing::warn!(conflicting_transactions = ?ids, "devices already held by active transactions");
        return Err(ApiError::conflict(format!(
            "one or more devices are already in use by active transactions: {ids:?}"
        )));
    }

    let transaction_id = TransactionId::generate();

    let (start_at, end_at) = match &request.time_period {
        Some(period) => {
            if let Some(end) = period.end_date {
                if end <= period.start_date {
                    return Err(ApiError::invalid_argument("endDate must be after startDate"));
                }
            }

            let now = Utc::now();
            let start_in_past = period.start_date < now;
            let end_in_past = period.end_date.is_some_and(|end| end < now);
            if start_in_past && end_in_past {
                return Err(ApiError::invalid_argument(
                    "both startDate and endDate are in the past",
                ));
            }
            // A past start with a live end fires immediately.

            (period.start_date, period.end_date)
        }
        None => (Utc::now(), None),
    };

    let data = ScheduleRequestedData {
        start_at,
        end_at,
        payload: PowerSavingPayload {
            devices: request.devices,
            enabled: request.enabled,
            subscription_request: request.subscription_request,
            transaction_id,
        },
    };

    let envelope = EventEnvelope::new(
        transaction_id.to_string(),
        EventType::ScheduleRequested,
        EventSource::Api,
        transaction_id.to_string(),
        &data,
    )
    .map_err(|e| {
        tracing::error!(error = %e, "failed to build schedule.requested event");
        ApiError::internal("failed to schedule request")
    })?;

    if let Err(e) = state.sender.send(envelope).await {
        tracing::error!(
            error = %e,
            transaction_id = %transaction_id,
            "failed to publish schedule.requested"
        );
        return Err(ApiError::internal("failed to schedule request"));
    }

    tracing::info!(
        transaction_id = %transaction_id,
        sub = %ctx.sub,
        request_id = %ctx.request_id,
        start_at = %start_at,
        "schedule requested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(PowerSavingResponse {
            transaction_id: Some(transaction_id.to_string()),
            activation_status: None,
        }),
    ))
}

/// `GET /features/power-saving/transactions/{transactionId}`.
pub async fn get_power_saving(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> ApiResult<Json<PowerSavingResponse>> {
    let transaction_id: TransactionId = transaction_id
        .parse()
        .map_err(|e: iotno_core::Error| ApiError::invalid_argument(e.to_string()))?;

    let transaction = state
        .store
        .get_transaction(transaction_id)
        .await?
        .ok_or_else(|| ApiError::not_found("transaction not found"))?;

    let activation_status = transaction
        .devices
        .iter()
        .map(|device| DeviceStatus {
            device: device.device.clone(),
            status: device.display_status(transaction.end_at),
        })
        .collect();

    Ok(Json(PowerSavingResponse {
        transaction_id: Some(transaction_id.to_string()),
        activation_status: Some(activation_status),
    }))
}

/// `GET /healthz`: probe endpoint, bypasses authentication.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
