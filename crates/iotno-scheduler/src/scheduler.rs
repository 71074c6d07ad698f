//! Timer ownership, claim, and per-device fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use iotno_bus::{BusError, EventHandler, EventSender};
use iotno_core::event::{
    AllDevicesCompletedData, DeviceActuationRequestData, ErrorNotificationData, EventEnvelope,
    ScheduleRequestedData, actuation_event_id, error_event_id,
};
use iotno_core::{Action, EventSource, EventType, SubscriptionRequest, TransactionId};
use iotno_store::model::{Transaction, TransactionDevice};
use iotno_store::{ClaimResult, CreateResult, Store};

use crate::SchedulerConfig;

/// A fired schedule waiting in the queue, with the subscription cached so
/// error notifications need no store read.
#[derive(Debug, Clone)]
struct ScheduleAction {
    transaction_id: TransactionId,
    action: Action,
    subscription_request: SubscriptionRequest,
}

type TimerMap = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// The scheduler service.
///
/// Owns the in-memory timer map (keyed `<transactionId>-<action>`), the
/// bounded fire queue, and its worker pool. Consumes `schedule.requested`
/// and `all-devices.completed` from the broker.
pub struct Scheduler {
    store: Arc<dyn Store>,
    sender: Arc<dyn EventSender>,
    fire_tx: mpsc::Sender<ScheduleAction>,
    timers: TimerMap,
    shutdown_tx: watch::Sender<bool>,
}

fn lock_err<T>(_: PoisonError<T>) -> BusError {
    BusError::handler("timer map lock poisoned")
}

impl Scheduler {
    /// Creates the scheduler and starts its fire worker pool.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        sender: Arc<dyn EventSender>,
        config: &SchedulerConfig,
    ) -> Arc<Self> {
        let (fire_tx, fire_rx) = mpsc::channel(config.channel_size);
        let (shutdown_tx, _) = watch::channel(false);

        let scheduler = Arc::new(Self {
            store,
            sender,
            fire_tx,
            timers: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        });

        Self::spawn_fire_workers(&scheduler, fire_rx, config.worker_count);
        scheduler
    }

    /// Returns a receiver signalling scheduler shutdown.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stops all in-memory timers and signals every background loop.
    ///
    /// The fire queue is not drained: anything still pending is re-armed by
    /// the next instance through rehydration.
    pub fn shutdown(&self) {
        tracing::info!("stopping scheduler");

        if let Ok(mut timers) = self.timers.lock() {
            for (key, handle) in timers.drain() {
                tracing::debug!(timer = %key, "cancelling timer");
                handle.abort();
            }
        }

        let _ = self.shutdown_tx.send(true);
    }

    /// Loads pending transactions and re-arms their timers.
    ///
    /// Start timers are armed for transactions whose start phase has not
    /// completed; end timers only where the start phase has completed and an
    /// end is scheduled, preserving the phase ordering across restarts.
    ///
    /// # Errors
    ///
    /// Returns an error when the pending-transaction query fails. New
    /// schedules keep working either way, so callers may log and continue.
    pub async fn rehydrate(&self) -> Result<(), BusError> {
        tracing::info!("loading pending schedules from store");

        let transactions = self
            .store
            .get_pending_transactions()
            .await
            .map_err(|e| BusError::handler_with_source("load pending transactions", e))?;

        if transactions.is_empty() {
            tracing::info!("no pending schedules to restore");
            return Ok(());
        }

        let count = transactions.len();
        for tx in transactions {
            if !tx.start_action_completed {
                let delay = delay_until(tx.start_at);
                tracing::debug!(
                    transaction_id = %tx.transaction_id,
                    delay_ms = delay.as_millis() as u64,
                    "re-arming start timer"
                );
                self.arm_timer(
                    tx.transaction_id,
                    Action::Start,
                    delay,
                    tx.subscription_request.clone(),
                );
            }

            if let Some(end_at) = tx.end_at {
                if tx.start_action_completed && !tx.end_action_completed {
                    let delay = delay_until(end_at);
                    tracing::debug!(
                        transaction_id = %tx.transaction_id,
                        delay_ms = delay.as_millis() as u64,
                        "re-arming end timer"
                    );
                    self.arm_timer(
                        tx.transaction_id,
                        Action::End,
                        delay,
                        tx.subscription_request.clone(),
                    );
                }
            }
        }

        tracing::info!(restored = count, "pending schedules restored");
        Ok(())
    }

    /// Arms (or replaces) the timer for `(transaction, action)`.
    fn arm_timer(
        &self,
        transaction_id: TransactionId,
        action: Action,
        delay: Duration,
        subscription_request: SubscriptionRequest,
    ) {
        let fire_tx = self.fire_tx.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let timers = Arc::clone(&self.timers);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            enqueue_schedule_action(
                fire_tx,
                shutdown,
                timers,
                ScheduleAction {
                    transaction_id,
                    action,
                    subscription_request,
                },
            )
            .await;
        });

        let key = timer_key(transaction_id, action);
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(previous) = timers.insert(key, handle) {
                previous.abort();
            }
        }
    }

    fn spawn_fire_workers(
        scheduler: &Arc<Self>,
        mut fire_rx: mpsc::Receiver<ScheduleAction>,
        worker_count: usize,
    ) {
        let scheduler = Arc::clone(scheduler);
        let mut shutdown = scheduler.shutdown_tx.subscribe();
        let semaphore = Arc::new(Semaphore::new(worker_count.max(1)));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        tracing::debug!("fire workers stopping");
                        break;
                    }

                    action = fire_rx.recv() => {
                        let Some(action) = action else { break };
                        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                            break;
                        };
                        let scheduler = Arc::clone(&scheduler);
                        tokio::spawn(async move {
                            let _permit = permit;
                            let transaction_id = action.transaction_id;
                            if let Err(e) = scheduler.fire_schedule(action).await {
                                tracing::error!(
                                    transaction_id = %transaction_id,
                                    error = %e,
                                    "failed to fire schedule"
                                );
                            }
                        });
                    }
                }
            }
        });
    }

    /// Claims the action and publishes one actuation request per device.
    async fn fire_schedule(&self, schedule: ScheduleAction) -> Result<(), BusError> {
        let ScheduleAction {
            transaction_id,
            action,
            subscription_request,
        } = schedule;

        let claim = match self.store.claim_action(transaction_id, action).await {
            Ok(claim) => claim,
            Err(e) => {
                self.send_error_notification(
                    transaction_id,
                    Some(action),
                    "INTERNAL_ERROR",
                    "Failed to claim transaction in database",
                    &subscription_request,
                )
                .await;
                return Err(BusError::handler_with_source("claim transaction", e));
            }
        };

        match claim {
            ClaimResult::AlreadyDone => {
                tracing::debug!(
                    transaction_id = %transaction_id,
                    action = %action,
                    "action already claimed or completed, skipping"
                );
                return Ok(());
            }
            ClaimResult::NotFound => {
                self.send_error_notification(
                    transaction_id,
                    Some(action),
                    "INTERNAL_ERROR",
                    "Failed to claim transaction in database",
                    &subscription_request,
                )
                .await;
                return Err(BusError::handler(format!(
                    "transaction not found: {transaction_id}"
                )));
            }
            ClaimResult::Claimed => {}
        }

        tracing::debug!(
            transaction_id = %transaction_id,
            action = %action,
            "transaction claimed, publishing actuation requests"
        );

        let transaction = match self.store.get_transaction(transaction_id).await {
            Ok(Some(transaction)) => transaction,
            Ok(None) | Err(_) => {
                let _ = self
                    .store
                    .mark_transaction_failed(transaction_id, "failed to retrieve transaction data")
                    .await;
                self.send_error_notification(
                    transaction_id,
                    Some(action),
                    "INTERNAL_ERROR",
                    "Failed to retrieve transaction data from database",
                    &subscription_request,
                )
                .await;
                return Err(BusError::handler(format!(
                    "get transaction {transaction_id} after claim"
                )));
            }
        };

        // End of a power-saving enable restores; end of a disable re-applies.
        let enabled = match action {
            Action::Start => transaction.enabled,
            Action::End => !transaction.enabled,
        };

        counter!("iotno_scheduler_actions_fired_total", "action" => action.as_str())
            .increment(1);

        for (index, device) in transaction.devices.iter().enumerate() {
            let data = DeviceActuationRequestData {
                device: device.device.clone(),
                enabled,
                transaction_id,
                action,
                subscription_request: subscription_request.clone(),
            };

            let send_result = match EventEnvelope::new(
                actuation_event_id(transaction_id, action, index),
                EventType::DeviceActuationRequest,
                EventSource::Scheduler,
                transaction_id.to_string(),
                &data,
            ) {
                Ok(envelope) => self.sender.send(envelope).await,
                Err(e) => Err(BusError::handler(e.to_string())),
            };

            // A failed publish leaves this device pending; the others still
            // advance.
            if let Err(e) = send_result {
                tracing::error!(
                    transaction_id = %transaction_id,
                    device_index = index,
                    error = %e,
                    "failed to publish actuation request for device"
                );
            }
        }

        tracing::debug!(
            transaction_id = %transaction_id,
            device_count = transaction.devices.len(),
            enabled,
            "device actuation requests published"
        );
        Ok(())
    }

    async fn handle_schedule_requested(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let data: ScheduleRequestedData = envelope
            .data_as()
            .map_err(|e| BusError::handler_with_source("unmarshal schedule data", e))?;

        let transaction_id = data.payload.transaction_id;
        tracing::info!(
            transaction_id = %transaction_id,
            start_at = %data.start_at,
            end_at = ?data.end_at,
            "received schedule request"
        );

        let mut devices = Vec::with_capacity(data.payload.devices.len());
        for device in data.payload.devices {
            let Some(device_id) = device.network_access_identifier.clone() else {
                tracing::error!(
                    transaction_id = %transaction_id,
                    "device missing network access identifier, skipping"
                );
                continue;
            };
            devices.push(TransactionDevice::new(device_id, device));
        }

        let transaction = Transaction::new(
            transaction_id,
            data.start_at,
            data.end_at,
            data.payload.enabled,
            data.payload.subscription_request.clone(),
            devices,
        );

        match self.store.create_transaction(transaction).await {
            Ok(CreateResult::Created) => {}
            Ok(CreateResult::AlreadyExists) => {
                tracing::info!(
                    transaction_id = %transaction_id,
                    "transaction already exists, replay ignored"
                );
            }
            Err(e) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "failed to create transaction"
                );
                self.send_error_notification(
                    transaction_id,
                    Some(Action::Start),
                    "INTERNAL_ERROR",
                    "Failed to create transaction in database",
                    &data.payload.subscription_request,
                )
                .await;
                return Err(BusError::handler_with_source("create transaction", e));
            }
        }

        let delay = delay_until(data.start_at);
        tracing::debug!(
            transaction_id = %transaction_id,
            delay_ms = delay.as_millis() as u64,
            "arming start timer"
        );
        // The end timer is armed only after the start phase completes.
        self.arm_timer(
            transaction_id,
            Action::Start,
            delay,
            data.payload.subscription_request,
        );

        Ok(())
    }

    async fn handle_all_devices_completed(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<(), BusError> {
        let data: AllDevicesCompletedData = envelope
            .data_as()
            .map_err(|e| BusError::handler_with_source("unmarshal completion data", e))?;

        // Only the start-phase completion gates the end timer.
        if data.action != Action::Start {
            tracing::debug!(action = %data.action, "ignoring non-start completion");
            return Ok(());
        }

        let transaction = self
            .store
            .get_transaction(data.transaction_id)
            .await
            .map_err(|e| BusError::handler_with_source("get transaction", e))?
            .ok_or_else(|| {
                BusError::handler(format!("transaction not found: {}", data.transaction_id))
            })?;

        let Some(end_at) = transaction.end_at else {
            tracing::debug!(
                transaction_id = %data.transaction_id,
                "no end scheduled, nothing to arm"
            );
            return Ok(());
        };

        if transaction.end_action_completed {
            tracing::debug!(
                transaction_id = %data.transaction_id,
                "end phase already completed, nothing to arm"
            );
            return Ok(());
        }

        let delay = delay_until(end_at);
        tracing::debug!(
            transaction_id = %data.transaction_id,
            delay_ms = delay.as_millis() as u64,
            end_at = %end_at,
            "arming end timer after start completion"
        );
        self.arm_timer(
            data.transaction_id,
            Action::End,
            delay,
            transaction.subscription_request,
        );

        Ok(())
    }

    async fn send_error_notification(
        &self,
        transaction_id: TransactionId,
        action: Option<Action>,
        code: &str,
        message: &str,
        subscription_request: &SubscriptionRequest,
    ) {
        if subscription_request.sink.is_empty() {
            tracing::warn!(
                transaction_id = %transaction_id,
                "no notification sink configured, skipping error notification"
            );
            return;
        }

        let data = ErrorNotificationData {
            transaction_id,
            status: 500,
            code: code.to_string(),
            message: message.to_string(),
            action,
            subscription_request: subscription_request.clone(),
        };

        let envelope = match EventEnvelope::new(
            error_event_id(transaction_id, action),
            EventType::PowerSavingError,
            EventSource::Scheduler,
            transaction_id.to_string(),
            &data,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "failed to build error notification event");
                return;
            }
        };

        if let Err(e) = self.sender.send(envelope).await {
            tracing::error!(
                transaction_id = %transaction_id,
                error = %e,
                "failed to send error notification event"
            );
        } else {
            tracing::info!(
                transaction_id = %transaction_id,
                error_code = %code,
                "error notification event sent"
            );
        }
    }

    /// Number of currently armed timers (observability and tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the timer map lock is poisoned.
    pub fn armed_timer_count(&self) -> Result<usize, BusError> {
        Ok(self.timers.lock().map_err(lock_err)?.len())
    }
}

#[async_trait]
impl EventHandler for Scheduler {
    async fn handle(&self, envelope: EventEnvelope) -> Result<(), BusError> {
        match envelope.event_type {
            EventType::ScheduleRequested => self.handle_schedule_requested(&envelope).await,
            EventType::AllDevicesCompleted => self.handle_all_devices_completed(&envelope).await,
            other => Err(BusError::handler(format!("unknown event type: {other}"))),
        }
    }
}

/// Enqueues a fired schedule. Attempts a non-blocking send first; a full
/// queue logs a warning and falls back to an awaited send racing shutdown
/// (acceptable backpressure, firings are rare and bursty).
async fn enqueue_schedule_action(
    fire_tx: mpsc::Sender<ScheduleAction>,
    mut shutdown: watch::Receiver<bool>,
    timers: TimerMap,
    action: ScheduleAction,
) {
    let key = timer_key(action.transaction_id, action.action);

    match fire_tx.try_send(action) {
        Ok(()) => {
            tracing::debug!(timer = %key, "schedule action enqueued for firing");
        }
        Err(mpsc::error::TrySendError::Full(action)) => {
            tracing::warn!(timer = %key, "fire queue full, schedule may be delayed");
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!(timer = %key, "scheduler stopped, skipping fire");
                }
                result = fire_tx.send(action) => {
                    if result.is_err() {
                        tracing::debug!(timer = %key, "fire queue closed, skipping fire");
                    }
                }
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(timer = %key, "scheduler stopped, skipping fire");
        }
    }

    if let Ok(mut timers) = timers.lock() {
        timers.remove(&key);
    }
}

fn timer_key(transaction_id: TransactionId, action: Action) -> String {
    format!("{transaction_id}-{action}")
}

fn delay_until(at: chrono::DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
