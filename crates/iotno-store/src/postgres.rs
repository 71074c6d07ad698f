//! Postgres store backend.
//!
//! Documents map to three tables: `transactions` (scalar fields and the
//! four action flags), `transaction_devices` (one row per embedded device,
//! action statuses as JSONB), and `device_original_state`. Every conditional
//! operation of the [`Store`] contract is a single conditional `UPDATE`
//! whose affected-row count decides the race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use iotno_core::{Action, Device, NetworkAccessIdentifier, SubscriptionRequest, TransactionId};

use crate::model::{
    ActionState, ActionStatus, DeviceOriginalState, Transaction, TransactionDevice,
    TransactionStatus,
};
use crate::{ActionGate, ActionOutcome, ClaimResult, CreateResult, Result, Store, StoreError};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS transactions (
    transaction_id UUID PRIMARY KEY,
    start_at TIMESTAMPTZ NOT NULL,
    end_at TIMESTAMPTZ,
    enabled BOOLEAN NOT NULL,
    subscription_request JSONB NOT NULL,
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    error_message TEXT,
    start_action_completed BOOLEAN NOT NULL DEFAULT FALSE,
    end_action_completed BOOLEAN NOT NULL DEFAULT FALSE,
    start_action_notified BOOLEAN NOT NULL DEFAULT FALSE,
    end_action_notified BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS transaction_devices (
    transaction_id UUID NOT NULL REFERENCES transactions(transaction_id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    device JSONB NOT NULL,
    start_action JSONB,
    end_action JSONB,
    PRIMARY KEY (transaction_id, device_id)
);

CREATE INDEX IF NOT EXISTS idx_transaction_devices_device_id
    ON transaction_devices (device_id);

CREATE TABLE IF NOT EXISTS device_original_state (
    device_id TEXT PRIMARY KEY,
    max_latency TEXT NOT NULL,
    max_response_time TEXT NOT NULL,
    captured_at TIMESTAMPTZ NOT NULL
);
";

/// Postgres-backed store for durable deployments.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    transaction_id: sqlx::types::Uuid,
    start_at: DateTime<Utc>,
    end_at: Option<DateTime<Utc>>,
    enabled: bool,
    subscription_request: Json<SubscriptionRequest>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
    start_action_completed: bool,
    end_action_completed: bool,
    start_action_notified: bool,
    end_action_notified: bool,
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    device: Json<Device>,
    start_action: Option<Json<ActionStatus>>,
    end_action: Option<Json<ActionStatus>>,
}

fn parse_status(status: &str) -> Result<TransactionStatus> {
    match status {
        "pending" => Ok(TransactionStatus::Pending),
        "processing" => Ok(TransactionStatus::Processing),
        "completed" => Ok(TransactionStatus::Completed),
        "failed" => Ok(TransactionStatus::Failed),
        other => Err(StoreError::backend(format!(
            "unknown transaction status in store: {other}"
        ))),
    }
}

const fn completed_column(action: Action) -> &'static str {
    match action {
        Action::Start => "start_action_completed",
        Action::End => "end_action_completed",
    }
}

const fn notified_column(action: Action) -> &'static str {
    match action {
        Action::Start => "start_action_notified",
        Action::End => "end_action_notified",
    }
}

const fn action_column(action: Action) -> &'static str {
    match action {
        Action::Start => "start_action",
        Action::End => "end_action",
    }
}

impl PostgresStore {
    /// Connects to the given database URI and bootstraps the schema.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection or schema bootstrap fails.
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(uri)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wraps an existing pool (used by tests with their own fixtures).
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when a DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_devices(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<TransactionDevice>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            "SELECT device_id, device, start_action, end_action
             FROM transaction_devices
             WHERE transaction_id = $1
             ORDER BY position",
        )
        .bind(transaction_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TransactionDevice {
                device_id: NetworkAccessIdentifier::new(row.device_id),
                device: row.device.0,
                start_action: row.start_action.map(|a| a.0),
                end_action: row.end_action.map(|a| a.0),
            })
            .collect())
    }

    async fn assemble(&self, row: TransactionRow) -> Result<Transaction> {
        let transaction_id = TransactionId::from_uuid(row.transaction_id);
        let devices = self.fetch_devices(transaction_id).await?;
        Ok(Transaction {
            transaction_id,
            start_at: row.start_at,
            end_at: row.end_at,
            enabled: row.enabled,
            subscription_request: row.subscription_request.0,
            status: parse_status(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            error_message: row.error_message,
            devices,
            start_action_completed: row.start_action_completed,
            end_action_completed: row.end_action_completed,
            start_action_notified: row.start_action_notified,
            end_action_notified: row.end_action_notified,
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_transaction(&self, transaction: Transaction) -> Result<CreateResult> {
        let mut db_tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO transactions (
                transaction_id, start_at, end_at, enabled, subscription_request,
                status, created_at, updated_at, error_message,
                start_action_completed, end_action_completed,
                start_action_notified, end_action_notified
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (transaction_id) DO NOTHING",
        )
        .bind(transaction.transaction_id.as_uuid())
        .bind(transaction.start_at)
        .bind(transaction.end_at)
        .bind(transaction.enabled)
        .bind(Json(&transaction.subscription_request))
        .bind(transaction.status.as_str())
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .bind(transaction.error_message.as_deref())
        .bind(transaction.start_action_completed)
        .bind(transaction.end_action_completed)
        .bind(transaction.start_action_notified)
        .bind(transaction.end_action_notified)
        .execute(&mut *db_tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            db_tx.rollback().await?;
            return Ok(CreateResult::AlreadyExists);
        }

        for (position, device) in transaction.devices.iter().enumerate() {
            sqlx::query(
                "INSERT INTO transaction_devices (
                    transaction_id, position, device_id, device, start_action, end_action
                 ) VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(transaction.transaction_id.as_uuid())
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .bind(device.device_id.as_str())
            .bind(Json(&device.device))
            .bind(device.start_action.as_ref().map(Json))
            .bind(device.end_action.as_ref().map(Json))
            .execute(&mut *db_tx)
            .await?;
        }

        db_tx.commit().await?;
        Ok(CreateResult::Created)
    }

    async fn get_transaction(&self, transaction_id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE transaction_id = $1",
        )
        .bind(transaction_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.assemble(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_pending_transactions(&self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE status IN ('pending', 'processing')",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut transactions = Vec::with_capacity(rows.len());
        for row in rows {
            transactions.push(self.assemble(row).await?);
        }
        Ok(transactions)
    }

    async fn claim_action(
        &self,
        transaction_id: TransactionId,
        action: Action,
    ) -> Result<ClaimResult> {
        let completed = completed_column(action);
        let claimed = sqlx::query(&format!(
            "UPDATE transactions
             SET status = 'processing', updated_at = NOW()
             WHERE transaction_id = $1
               AND status IN ('pending', 'processing')
               AND {completed} = FALSE"
        ))
        .bind(transaction_id.as_uuid())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 1 {
            return Ok(ClaimResult::Claimed);
        }

        let exists = sqlx::query("SELECT 1 FROM transactions WHERE transaction_id = $1")
            .bind(transaction_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if exists {
            Ok(ClaimResult::AlreadyDone)
        } else {
            Ok(ClaimResult::NotFound)
        }
    }

    async fn mark_transaction_failed(
        &self,
        transaction_id: TransactionId,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE transactions
             SET status = 'failed', error_message = $2, updated_at = NOW()
             WHERE transaction_id = $1",
        )
        .bind(transaction_id.as_uuid())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_transaction_completed(&self, transaction_id: TransactionId) -> Result<()> {
        sqlx::query(
            "UPDATE transactions
             SET status = 'completed', updated_at = NOW()
             WHERE transaction_id = $1",
        )
        .bind(transaction_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_device_conflicts(
        &self,
        device_ids: &[NetworkAccessIdentifier],
    ) -> Result<Vec<TransactionId>> {
        let ids: Vec<String> = device_ids.iter().map(|d| d.as_str().to_string()).collect();

        let rows = sqlx::query(
            "SELECT DISTINCT t.transaction_id
             FROM transactions t
             JOIN transaction_devices d ON d.transaction_id = t.transaction_id
             WHERE t.status IN ('pending', 'processing')
               AND d.device_id = ANY($1)
             ORDER BY t.transaction_id",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                row.try_get::<sqlx::types::Uuid, _>("transaction_id")
                    .map(TransactionId::from_uuid)
                    .map_err(StoreError::from)
            })
            .collect()
    }

    async fn delete_old_transactions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM transactions
             WHERE status IN ('completed', 'failed') AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn upsert_original_state(&self, state: DeviceOriginalState) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_original_state (device_id, max_latency, max_response_time, captured_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (device_id) DO UPDATE
             SET max_latency = EXCLUDED.max_latency,
                 max_response_time = EXCLUDED.max_response_time,
                 captured_at = EXCLUDED.captured_at",
        )
        .bind(state.device_id.as_str())
        .bind(&state.max_latency)
        .bind(&state.max_response_time)
        .bind(state.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_original_state(
        &self,
        device_id: &NetworkAccessIdentifier,
    ) -> Result<Option<DeviceOriginalState>> {
        let row = sqlx::query(
            "SELECT device_id, max_latency, max_response_time, captured_at
             FROM device_original_state WHERE device_id = $1",
        )
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(DeviceOriginalState {
                device_id: NetworkAccessIdentifier::new(row.try_get::<String, _>("device_id")?),
                max_latency: row.try_get("max_latency")?,
                max_response_time: row.try_get("max_response_time")?,
                timestamp: row.try_get("captured_at")?,
            })
        })
        .transpose()
    }

    async fn missing_original_states(
        &self,
        device_ids: &[NetworkAccessIdentifier],
    ) -> Result<Vec<NetworkAccessIdentifier>> {
        let ids: Vec<String> = device_ids.iter().map(|d| d.as_str().to_string()).collect();

        let rows = sqlx::query(
            "SELECT device_id FROM device_original_state WHERE device_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut existing = std::collections::HashSet::new();
        for row in &rows {
            existing.insert(row.try_get::<String, _>("device_id")?);
        }

        Ok(device_ids
            .iter()
            .filter(|d| !existing.contains(d.as_str()))
            .cloned()
            .collect())
    }

    async fn begin_device_action(
        &self,
        transaction_id: TransactionId,
        device_id: &NetworkAccessIdentifier,
        action: Action,
    ) -> Result<ActionGate> {
        let column = action_column(action);
        let stamp = Json(ActionStatus::now(ActionState::InProgress));

        let updated = sqlx::query(&format!(
            "UPDATE transaction_devices
             SET {column} = $3
             WHERE transaction_id = $1
               AND device_id = $2
               AND ({column} IS NULL OR {column}->>'status' IN ('pending', 'in-progress'))"
        ))
        .bind(transaction_id.as_uuid())
        .bind(device_id.as_str())
        .bind(stamp)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            sqlx::query("UPDATE transactions SET updated_at = NOW() WHERE transaction_id = $1")
                .bind(transaction_id.as_uuid())
                .execute(&self.pool)
                .await?;
            return Ok(ActionGate::Started);
        }

        let exists = sqlx::query(
            "SELECT 1 FROM transaction_devices WHERE transaction_id = $1 AND device_id = $2",
        )
        .bind(transaction_id.as_uuid())
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        if exists {
            Ok(ActionGate::AlreadyTerminal)
        } else {
            Err(StoreError::DeviceNotFound {
                transaction_id,
                device_id: device_id.clone(),
            })
        }
    }

    async fn complete_device_action(
        &self,
        transaction_id: TransactionId,
        device_id: &NetworkAccessIdentifier,
        action: Action,
        outcome: ActionOutcome,
    ) -> Result<Transaction> {
        let column = action_column(action);
        let stamp = Json(ActionStatus::now(outcome.as_state()));

        let updated = sqlx::query(&format!(
            "UPDATE transaction_devices
             SET {column} = $3
             WHERE transaction_id = $1 AND device_id = $2"
        ))
        .bind(transaction_id.as_uuid())
        .bind(device_id.as_str())
        .bind(stamp)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::DeviceNotFound {
                transaction_id,
                device_id: device_id.clone(),
            });
        }

        sqlx::query("UPDATE transactions SET updated_at = NOW() WHERE transaction_id = $1")
            .bind(transaction_id.as_uuid())
            .execute(&self.pool)
            .await?;

        self.get_transaction(transaction_id)
            .await?
            .ok_or(StoreError::TransactionNotFound { transaction_id })
    }

    async fn claim_notification(
        &self,
        transaction_id: TransactionId,
        action: Action,
    ) -> Result<bool> {
        let notified = notified_column(action);
        let completed = completed_column(action);

        let won = sqlx::query(&format!(
            "UPDATE transactions
             SET {notified} = TRUE, {completed} = TRUE, updated_at = NOW()
             WHERE transaction_id = $1 AND {notified} = FALSE"
        ))
        .bind(transaction_id.as_uuid())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(won == 1)
    }
}
