//! Store documents: transactions, per-device action status, and captured
//! device original state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use iotno_core::{Action, Device, NetworkAccessIdentifier, SubscriptionRequest, TransactionId};

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Created, no phase fired yet.
    Pending,
    /// A phase has been claimed and actuation is underway.
    Processing,
    /// All scheduled phases finished (device-level failures included).
    Completed,
    /// An unrecoverable processing error occurred.
    Failed,
}

impl TransactionStatus {
    /// Returns true for terminal statuses eligible for retention cleanup.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Status of one device's action within one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    /// Actuation event emitted, not picked up yet.
    #[serde(rename = "pending")]
    Pending,
    /// A worker is actuating the device.
    #[serde(rename = "in-progress")]
    InProgress,
    /// Actuation succeeded.
    #[serde(rename = "success")]
    Success,
    /// Actuation failed; the phase still completes.
    #[serde(rename = "failed")]
    Failed,
}

impl ActionState {
    /// Returns true once the state can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stamped action state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStatus {
    /// Current state of the action.
    pub status: ActionState,
    /// When the state was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ActionStatus {
    /// Creates a status stamped with the current time.
    #[must_use]
    pub fn now(status: ActionState) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
        }
    }
}

/// One device embedded in a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDevice {
    /// Canonical device identifier.
    pub device_id: NetworkAccessIdentifier,
    /// The identifier payload as originally supplied.
    pub device: Device,
    /// Start-phase action status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_action: Option<ActionStatus>,
    /// End-phase action status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_action: Option<ActionStatus>,
}

impl TransactionDevice {
    /// Creates a device entry with a pending start action.
    #[must_use]
    pub fn new(device_id: NetworkAccessIdentifier, device: Device) -> Self {
        Self {
            device_id,
            device,
            start_action: Some(ActionStatus::now(ActionState::Pending)),
            end_action: None,
        }
    }

    /// Returns the action status for the given phase.
    #[must_use]
    pub fn action(&self, action: Action) -> Option<&ActionStatus> {
        match action {
            Action::Start => self.start_action.as_ref(),
            Action::End => self.end_action.as_ref(),
        }
    }

    /// Mutable access to the action status for the given phase.
    pub fn action_mut(&mut self, action: Action) -> &mut Option<ActionStatus> {
        match action {
            Action::Start => &mut self.start_action,
            Action::End => &mut self.end_action,
        }
    }

    /// Projects the per-phase status for callbacks. A missing status
    /// projects as pending (the actuation event has not been picked up).
    #[must_use]
    pub fn phase_status(&self, action: Action) -> ActionState {
        self.action(action).map_or(ActionState::Pending, |a| a.status)
    }

    /// Projects the combined display status for the status-query endpoint.
    ///
    /// The end action, once present, wins. Otherwise a successful start on a
    /// transaction with a scheduled end shows as in-progress (the window is
    /// still open); without an end it is simply success.
    #[must_use]
    pub fn display_status(&self, end_at: Option<DateTime<Utc>>) -> ActionState {
        if let Some(end) = &self.end_action {
            return end.status;
        }
        match &self.start_action {
            Some(start) => match start.status {
                ActionState::Success if end_at.is_some() => ActionState::InProgress,
                other => other,
            },
            None => ActionState::Pending,
        }
    }
}

/// A power-saving transaction with all of its devices embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Primary key.
    pub transaction_id: TransactionId,
    /// When the start phase fires.
    pub start_at: DateTime<Utc>,
    /// When the end phase fires, if scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,
    /// True applies power-saving at start; false restores at start.
    pub enabled: bool,
    /// Callback subscription.
    pub subscription_request: SubscriptionRequest,
    /// Lifecycle status.
    pub status: TransactionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp; drives retention.
    pub updated_at: DateTime<Utc>,
    /// Failure detail when status is failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// All devices in this transaction.
    pub devices: Vec<TransactionDevice>,
    /// Set by the start-phase notifier election.
    pub start_action_completed: bool,
    /// Set by the end-phase notifier election.
    pub end_action_completed: bool,
    /// At-most-once guard for the start-phase completion event.
    pub start_action_notified: bool,
    /// At-most-once guard for the end-phase completion event.
    pub end_action_notified: bool,
}

impl Transaction {
    /// Creates a pending transaction with all flags cleared.
    #[must_use]
    pub fn new(
        transaction_id: TransactionId,
        start_at: DateTime<Utc>,
        end_at: Option<DateTime<Utc>>,
        enabled: bool,
        subscription_request: SubscriptionRequest,
        devices: Vec<TransactionDevice>,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id,
            start_at,
            end_at,
            enabled,
            subscription_request,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
            error_message: None,
            devices,
            start_action_completed: false,
            end_action_completed: false,
            start_action_notified: false,
            end_action_notified: false,
        }
    }

    /// Returns the completed flag for the given phase.
    #[must_use]
    pub const fn action_completed(&self, action: Action) -> bool {
        match action {
            Action::Start => self.start_action_completed,
            Action::End => self.end_action_completed,
        }
    }

    /// Returns the notified flag for the given phase.
    #[must_use]
    pub const fn action_notified(&self, action: Action) -> bool {
        match action {
            Action::Start => self.start_action_notified,
            Action::End => self.end_action_notified,
        }
    }

    /// Counts devices whose action for the given phase is terminal.
    #[must_use]
    pub fn terminal_device_count(&self, action: Action) -> usize {
        self.devices
            .iter()
            .filter(|d| d.action(action).is_some_and(|a| a.status.is_terminal()))
            .count()
    }

    /// Returns true when every device has reached a terminal status for the
    /// given phase (and there is at least one device).
    #[must_use]
    pub fn all_devices_terminal(&self, action: Action) -> bool {
        !self.devices.is_empty() && self.terminal_device_count(action) == self.devices.len()
    }
}

/// Captured original device configuration, shared across transactions.
///
/// Upsert-only: each capture replaces the previous one, so a device's
/// original is always the most recent pre-power-saving state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOriginalState {
    /// Canonical device identifier.
    pub device_id: NetworkAccessIdentifier,
    /// Captured maximum latency.
    pub max_latency: String,
    /// Captured maximum response time.
    pub max_response_time: String,
    /// When the capture happened.
    pub timestamp: DateTime<Utc>,
}
