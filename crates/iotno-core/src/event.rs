//! Inter-service events.
//!
//! All services exchange `CloudEvents`-compatible envelopes through the
//! broker:
//! - `id`: deterministic per logical event, so consumers can deduplicate
//! - `source`: originating service URN
//! - `specversion`: `CloudEvents` spec version ("1.0")
//! - `type`: event type URN
//! - `time`: emission timestamp
//! - `partitionkey` extension: the transaction ID, so one transaction's
//!   events share a broker partition
//! - `data`: the JSON payload
//!
//! Deterministic event IDs carry the idempotency story: a redelivered or
//! re-emitted logical event has the same ID, and every consumer-side state
//! transition is additionally guarded by a conditional store update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::Result;
use crate::id::TransactionId;
use crate::subscription::SubscriptionRequest;

/// Event types routed through the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Sent by the API to create a new schedule.
    #[serde(rename = "it.tim.iot.schedule.requested")]
    ScheduleRequested,
    /// Sent by the scheduler to perform device actuation.
    #[serde(rename = "it.tim.iot.device.actuation.request")]
    DeviceActuationRequest,
    /// Sent when all devices for an action have reached a terminal status.
    #[serde(rename = "it.tim.iot.all-devices.completed")]
    AllDevicesCompleted,
    /// Sent when a system-level error prevents processing.
    #[serde(rename = "it.tim.iot.notify.error.requested")]
    PowerSavingError,
}

impl EventType {
    /// Returns the event type URN.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduleRequested => "it.tim.iot.schedule.requested",
            Self::DeviceActuationRequest => "it.tim.iot.device.actuation.request",
            Self::AllDevicesCompleted => "it.tim.iot.all-devices.completed",
            Self::PowerSavingError => "it.tim.iot.notify.error.requested",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Originating service of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// The admission API service.
    #[serde(rename = "urn:tim:iot-api")]
    Api,
    /// The scheduler service.
    #[serde(rename = "urn:tim:iot-scheduler")]
    Scheduler,
    /// The actuation worker service.
    #[serde(rename = "urn:tim:iot-worker")]
    Worker,
    /// The notifier service.
    #[serde(rename = "urn:tim:iot-notify")]
    Notify,
}

impl EventSource {
    /// Returns the source URN.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "urn:tim:iot-api",
            Self::Scheduler => "urn:tim:iot-scheduler",
            Self::Worker => "urn:tim:iot-worker",
            Self::Notify => "urn:tim:iot-notify",
        }
    }
}

/// The two temporal phases of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Fired at the schedule start.
    Start,
    /// Fired at the schedule end (only when `endAt` is set).
    End,
}

impl Action {
    /// Returns the wire name of the action.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `CloudEvents`-compatible envelope for inter-service events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Deterministic event identifier.
    pub id: String,
    /// Event origin URN.
    pub source: EventSource,
    /// `CloudEvents` specification version.
    pub specversion: String,
    /// Event type URN.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Emission timestamp.
    pub time: DateTime<Utc>,
    /// Content type of the data field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Partition key extension: the transaction ID.
    pub partitionkey: String,
    /// Event payload.
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Creates an envelope with the given deterministic ID and payload.
    ///
    /// The partition key is not derived from the event ID;
    /// callers pass the transaction ID explicitly so related events land on
    /// the same partition.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload fails to serialize.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        event_type: EventType,
        source: EventSource,
        partition_key: impl Into<String>,
        data: &T,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            source,
            specversion: "1.0".into(),
            event_type,
            time: Utc::now(),
            datacontenttype: Some("application/json".into()),
            partitionkey: partition_key.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Deserializes the payload into the expected data type.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload does not match `T`.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Payload of `schedule.requested` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequestedData {
    /// When the start phase fires.
    pub start_at: DateTime<Utc>,
    /// When the end phase fires, if scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    /// The admitted request.
    pub payload: PowerSavingPayload,
}

/// The admitted power-saving request carried inside `schedule.requested`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerSavingPayload {
    /// Devices with resolved network access identifiers.
    pub devices: Vec<Device>,
    /// True applies power-saving at start; false restores at start.
    pub enabled: bool,
    /// Callback subscription.
    pub subscription_request: SubscriptionRequest,
    /// The allocated transaction ID.
    pub transaction_id: TransactionId,
}

/// Payload of `device.actuation.request` events (one per device).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceActuationRequestData {
    /// The device to actuate (NAI resolved).
    pub device: Device,
    /// Effective intent for this phase: start carries the transaction's
    /// `enabled`, end carries its inverse.
    pub enabled: bool,
    /// Owning transaction.
    pub transaction_id: TransactionId,
    /// Which phase this actuation belongs to.
    pub action: Action,
    /// Callback subscription, forwarded for completion events.
    pub subscription_request: SubscriptionRequest,
}

/// Payload of `all-devices.completed` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllDevicesCompletedData {
    /// The completed transaction.
    pub transaction_id: TransactionId,
    /// Which phase completed.
    pub action: Action,
    /// When the final device reached a terminal status.
    pub completed_at: DateTime<Utc>,
    /// Callback subscription.
    pub subscription_request: SubscriptionRequest,
}

/// Payload of `notify.error.requested` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotificationData {
    /// The affected transaction.
    pub transaction_id: TransactionId,
    /// HTTP-style status associated with the error.
    pub status: u16,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// The failing phase, if the error is phase-specific.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Callback subscription.
    pub subscription_request: SubscriptionRequest,
}

/// Deterministic event ID for a per-device actuation request.
#[must_use]
pub fn actuation_event_id(transaction_id: TransactionId, action: Action, index: usize) -> String {
    format!("{transaction_id}-{action}-device-{index}")
}

/// Deterministic event ID for an all-devices-completed event.
#[must_use]
pub fn all_completed_event_id(transaction_id: TransactionId, action: Action) -> String {
    format!("{transaction_id}-{action}-all-completed")
}

/// Deterministic event ID for an error notification event.
#[must_use]
pub fn error_event_id(transaction_id: TransactionId, action: Option<Action>) -> String {
    match action {
        Some(action) => format!("{transaction_id}-{action}-error"),
        None => format!("{transaction_id}-error"),
    }
}
