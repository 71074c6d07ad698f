//! # iotno-store
//!
//! Persistence for power-saving transactions and captured device state.
//!
//! The [`Store`] trait is the concurrency rendezvous point of the whole
//! system: every cross-service race is resolved by one of its conditional
//! operations rather than by locks.
//!
//! - **Claim** ([`Store::claim_action`]): moves a `(transaction, action)`
//!   pair from "not yet fired" to "fired" exactly once across all scheduler
//!   workers.
//! - **Gate** ([`Store::begin_device_action`]): stamps a device in-progress
//!   only when the action is not already terminal, so broker redeliveries
//!   cannot regress a finished device.
//! - **Election** ([`Store::claim_notification`]): among all workers that
//!   observe "all devices terminal", exactly one wins the right to emit the
//!   completion event.
//!
//! Two backends are provided: [`memory::MemoryStore`] for tests and local
//! development, and [`postgres::PostgresStore`] for durable deployments.

pub mod memory;
pub mod model;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use iotno_core::{Action, NetworkAccessIdentifier, TransactionId};

use crate::model::{ActionState, DeviceOriginalState, Transaction};

/// The result type used by store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A transaction was not found.
    #[error("transaction not found: {transaction_id}")]
    TransactionNotFound {
        /// The missing transaction.
        transaction_id: TransactionId,
    },

    /// A device was not found within a transaction.
    #[error("device {device_id} not found in transaction {transaction_id}")]
    DeviceNotFound {
        /// The owning transaction.
        transaction_id: TransactionId,
        /// The missing device.
        device_id: NetworkAccessIdentifier,
    },

    /// A backend failure (connection, query, serialization).
    #[error("store backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    /// Creates a backend error from a message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a backend error wrapping a source error.
    #[must_use]
    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend_with_source("query failed", err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::backend_with_source("document serialization failed", err)
    }
}

/// Result of inserting a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateResult {
    /// The row was inserted.
    Created,
    /// A row with this primary key already exists (idempotent replay).
    AlreadyExists,
}

/// Result of the per-action claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// This caller won the claim and must fan out actuation events.
    Claimed,
    /// The action was already claimed or completed; drop silently.
    AlreadyDone,
    /// The transaction row does not exist.
    NotFound,
}

/// Result of the in-progress gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionGate {
    /// The device was stamped in-progress; proceed with actuation.
    Started,
    /// The device action is already terminal; skip re-actuation.
    AlreadyTerminal,
}

/// Terminal outcome of a device action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Actuation succeeded.
    Success,
    /// Actuation failed.
    Failed,
}

impl ActionOutcome {
    /// Maps the outcome to the stored action state.
    #[must_use]
    pub const fn as_state(self) -> ActionState {
        match self {
            Self::Success => ActionState::Success,
            Self::Failed => ActionState::Failed,
        }
    }
}

/// Storage contract shared by all services.
///
/// Implementations must make every method atomic with respect to concurrent
/// callers; the orchestration relies on the conditional operations admitting
/// exactly one winner per race.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a new transaction row.
    ///
    /// Idempotent on the primary key: replaying the same insert reports
    /// [`CreateResult::AlreadyExists`] without mutating the row.
    async fn create_transaction(&self, transaction: Transaction) -> Result<CreateResult>;

    /// Fetches a transaction by ID.
    async fn get_transaction(&self, transaction_id: TransactionId) -> Result<Option<Transaction>>;

    /// Fetches all transactions with status pending or processing, for
    /// scheduler rehydration after a restart.
    async fn get_pending_transactions(&self) -> Result<Vec<Transaction>>;

    /// Atomically claims a `(transaction, action)` pair for firing.
    ///
    /// The claim matches only rows with status pending or processing whose
    /// action-completed flag is still false; on success the row moves to
    /// processing and `updatedAt` is stamped.
    async fn claim_action(
        &self,
        transaction_id: TransactionId,
        action: Action,
    ) -> Result<ClaimResult>;

    /// Marks a transaction failed with an error message.
    async fn mark_transaction_failed(
        &self,
        transaction_id: TransactionId,
        error_message: &str,
    ) -> Result<()>;

    /// Marks a transaction completed.
    async fn mark_transaction_completed(&self, transaction_id: TransactionId) -> Result<()>;

    /// Returns the IDs of pending/processing transactions referencing any of
    /// the given devices. A device may be held by at most one in-flight
    /// transaction, so a non-empty result rejects admission.
    async fn find_device_conflicts(
        &self,
        device_ids: &[NetworkAccessIdentifier],
    ) -> Result<Vec<TransactionId>>;

    /// Deletes terminal transactions last updated before `older_than`.
    /// Returns the number of rows deleted.
    async fn delete_old_transactions(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Stores (or replaces) a device's captured original state.
    async fn upsert_original_state(&self, state: DeviceOriginalState) -> Result<()>;

    /// Fetches a device's captured original state.
    async fn get_original_state(
        &self,
        device_id: &NetworkAccessIdentifier,
    ) -> Result<Option<DeviceOriginalState>>;

    /// Returns the subset of `device_ids` with no captured original state.
    /// Restores are only admitted when this comes back empty.
    async fn missing_original_states(
        &self,
        device_ids: &[NetworkAccessIdentifier],
    ) -> Result<Vec<NetworkAccessIdentifier>>;

    /// Stamps a device action in-progress, gated on the action not being
    /// terminal yet. Terminal statuses never regress.
    async fn begin_device_action(
        &self,
        transaction_id: TransactionId,
        device_id: &NetworkAccessIdentifier,
        action: Action,
    ) -> Result<ActionGate>;

    /// Records a device action's terminal outcome and returns the
    /// post-image of the transaction for completion detection.
    async fn complete_device_action(
        &self,
        transaction_id: TransactionId,
        device_id: &NetworkAccessIdentifier,
        action: Action,
        outcome: ActionOutcome,
    ) -> Result<Transaction>;

    /// Notifier election: atomically sets the action's notified and
    /// completed flags, filtered on notified still being false.
    ///
    /// Returns true for exactly one caller per `(transaction, action)` pair;
    /// all others observe false.
    async fn claim_notification(
        &self,
        transaction_id: TransactionId,
        action: Action,
    ) -> Result<bool>;
}
