//! Per-device actuation and completion detection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;

use iotno_bus::{BusError, EventHandler, EventSender};
use iotno_core::config::PowerSavingConfig;
use iotno_core::event::{
    AllDevicesCompletedData, DeviceActuationRequestData, EventEnvelope, all_completed_event_id,
};
use iotno_core::{Action, Device, EventSource, EventType, NetworkAccessIdentifier, TransactionId};
use iotno_nef::{DeviceConfig, NefClient};
use iotno_store::model::DeviceOriginalState;
use iotno_store::{ActionGate, ActionOutcome, Store};

/// The actuation worker service.
pub struct ActuationWorker {
    store: Arc<dyn Store>,
    nef: Arc<dyn NefClient>,
    sender: Arc<dyn EventSender>,
    power_saving: PowerSavingConfig,
}

impl ActuationWorker {
    /// Creates a worker with the given store, backend client, and profile.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        nef: Arc<dyn NefClient>,
        sender: Arc<dyn EventSender>,
        power_saving: PowerSavingConfig,
    ) -> Self {
        Self {
            store,
            nef,
            sender,
            power_saving,
        }
    }

    fn power_saving_profile(&self) -> DeviceConfig {
        DeviceConfig {
            max_latency: self.power_saving.max_latency.clone(),
            max_response_time: self.power_saving.max_response_time.clone(),
        }
    }

    async fn handle_actuation_request(&self, envelope: &EventEnvelope) -> Result<(), BusError> {
        let data: DeviceActuationRequestData = envelope
            .data_as()
            .map_err(|e| BusError::handler_with_source("unmarshal actuation data", e))?;

        let device_id = data
            .device
            .network_access_identifier
            .clone()
            .ok_or_else(|| BusError::handler("actuation request without device identifier"))?;

        tracing::info!(
            device_id = %device_id,
            transaction_id = %data.transaction_id,
            action = %data.action,
            enabled = data.enabled,
            "received device actuation request"
        );

        self.process_device(
            &data,
            &device_id,
        )
        .await?;

        tracing::debug!(device_id = %device_id, "device actuation handled");
        Ok(())
    }

    async fn process_device(
        &self,
        data: &DeviceActuationRequestData,
        device_id: &NetworkAccessIdentifier,
    ) -> Result<(), BusError> {
        let transaction_id = data.transaction_id;
        let action = data.action;

        let gate = self
            .store
            .begin_device_action(transaction_id, device_id, action)
            .await
            .map_err(|e| BusError::handler_with_source("update status to in-progress", e))?;

        // A redelivered event for an already-terminal device must not
        // regress the status or touch the device again.
        if gate == ActionGate::AlreadyTerminal {
            tracing::debug!(
                device_id = %device_id,
                transaction_id = %transaction_id,
                action = %action,
                "device action already terminal, skipping redelivery"
            );
            return Ok(());
        }

        let outcome = self
            .actuate(&data.device, device_id, action, data.enabled)
            .await;

        counter!(
            "iotno_worker_actuations_total",
            "action" => action.as_str(),
            "outcome" => match outcome { ActionOutcome::Success => "success", ActionOutcome::Failed => "failed" },
        )
        .increment(1);

        let post_image = self
            .store
            .complete_device_action(transaction_id, device_id, action, outcome)
            .await
            .map_err(|e| BusError::handler_with_source("update device status", e))?;

        let all_terminal = post_image.all_devices_terminal(action);
        tracing::debug!(
            device_id = %device_id,
            outcome = ?outcome,
            all_terminal,
            "device status updated"
        );

        if !all_terminal {
            return Ok(());
        }

        // All devices are terminal; at most one worker may emit the
        // completion event. The election flips the notified flag under a
        // condition, so every loser sees a zero-row match.
        let won = self
            .store
            .claim_notification(transaction_id, action)
            .await
            .map_err(|e| BusError::handler_with_source("notification election", e))?;

        if !won {
            tracing::debug!(
                transaction_id = %transaction_id,
                action = %action,
                "completion already notified by another worker"
            );
            return Ok(());
        }

        tracing::info!(
            transaction_id = %transaction_id,
            action = %action,
            "all devices completed, emitting completion event"
        );

        let completion = AllDevicesCompletedData {
            transaction_id,
            action,
            completed_at: Utc::now(),
            subscription_request: data.subscription_request.clone(),
        };

        let envelope = EventEnvelope::new(
            all_completed_event_id(transaction_id, action),
            EventType::AllDevicesCompleted,
            EventSource::Worker,
            transaction_id.to_string(),
            &completion,
        )
        .map_err(|e| BusError::handler(e.to_string()))?;

        self.sender
            .send(envelope)
            .await
            .map_err(|e| BusError::handler_with_source("send all-devices.completed event", e))?;

        if let Err(e) = self
            .mark_transaction_complete_if_done(transaction_id, action)
            .await
        {
            tracing::error!(
                transaction_id = %transaction_id,
                error = %e,
                "failed to mark transaction as completed"
            );
        }

        Ok(())
    }

    /// Runs the operation selected by `(action, enabled)` and returns the
    /// terminal outcome to record.
    async fn actuate(
        &self,
        device: &Device,
        device_id: &NetworkAccessIdentifier,
        action: Action,
        enabled: bool,
    ) -> ActionOutcome {
        let apply_power_saving = match action {
            Action::Start => enabled,
            Action::End => !enabled,
        };

        if apply_power_saving {
            if action == Action::Start {
                // Capture before the first write so a later restore can
                // return the device to what it was.
                match self.capture_original_state(device, device_id).await {
                    Ok(()) => {}
                    Err(outcome) => return outcome,
                }
            }

            let profile = self.power_saving_profile();
            match self.nef.set_device_config(device, &profile).await {
                Ok(()) => {
                    tracing::debug!(device_id = %device_id, "power-saving profile applied");
                    ActionOutcome::Success
                }
                Err(e) => {
                    tracing::error!(device_id = %device_id, error = %e, "failed to apply power-saving profile");
                    ActionOutcome::Failed
                }
            }
        } else {
            self.restore_original_state(device, device_id).await
        }
    }

    async fn capture_original_state(
        &self,
        device: &Device,
        device_id: &NetworkAccessIdentifier,
    ) -> Result<(), ActionOutcome> {
        let current = match self.nef.get_device_config(device).await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "failed to read device configuration");
                return Err(ActionOutcome::Failed);
            }
        };

        let state = DeviceOriginalState {
            device_id: device_id.clone(),
            max_latency: current.max_latency.clone(),
            max_response_time: current.max_response_time.clone(),
            timestamp: Utc::now(),
        };

        if let Err(e) = self.store.upsert_original_state(state).await {
            tracing::error!(device_id = %device_id, error = %e, "failed to store device original state");
            return Err(ActionOutcome::Failed);
        }

        tracing::debug!(
            device_id = %device_id,
            max_latency = %current.max_latency,
            max_response_time = %current.max_response_time,
            "captured original device configuration"
        );
        Ok(())
    }

    async fn restore_original_state(
        &self,
        device: &Device,
        device_id: &NetworkAccessIdentifier,
    ) -> ActionOutcome {
        let stored = match self.store.get_original_state(device_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::error!(
                    device_id = %device_id,
                    "no original state captured for device, cannot restore"
                );
                return ActionOutcome::Failed;
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "failed to read original state");
                return ActionOutcome::Failed;
            }
        };

        let original = DeviceConfig {
            max_latency: stored.max_latency,
            max_response_time: stored.max_response_time,
        };

        match self.nef.set_device_config(device, &original).await {
            Ok(()) => {
                tracing::debug!(device_id = %device_id, "original configuration restored");
                ActionOutcome::Success
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "failed to restore device configuration");
                ActionOutcome::Failed
            }
        }
    }

    /// The transaction terminates with the phase that has nothing after it:
    /// the end phase, or a start phase with no end scheduled.
    async fn mark_transaction_complete_if_done(
        &self,
        transaction_id: TransactionId,
        action: Action,
    ) -> Result<(), BusError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await
            .map_err(|e| BusError::handler_with_source("get transaction", e))?
            .ok_or_else(|| BusError::handler(format!("transaction not found: {transaction_id}")))?;

        let should_complete = match action {
            Action::Start => transaction.end_at.is_none(),
            Action::End => true,
        };

        if should_complete {
            self.store
                .mark_transaction_completed(transaction_id)
                .await
                .map_err(|e| BusError::handler_with_source("mark transaction completed", e))?;
            tracing::info!(transaction_id = %transaction_id, "transaction marked as completed");
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for ActuationWorker {
    async fn handle(&self, envelope: EventEnvelope) -> Result<(), BusError> {
        match envelope.event_type {
            EventType::DeviceActuationRequest => self.handle_actuation_request(&envelope).await,
            other => Err(BusError::handler(format!("unknown event type: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use iotno_core::event::actuation_event_id;
    use iotno_core::subscription::{Protocol, SubscriptionRequest};
    use iotno_nef::{NefError, Result as NefResult};
    use iotno_store::memory::MemoryStore;
    use iotno_store::model::{ActionState, Transaction, TransactionDevice, TransactionStatus};

    /// NEF test double: answers like the stub but records calls and fails
    /// writes for blocklisted devices.
    struct ScriptedNef {
        get_calls: Mutex<Vec<String>>,
        set_calls: Mutex<Vec<(String, DeviceConfig)>>,
        fail_set_for: Mutex<HashSet<String>>,
    }

    impl ScriptedNef {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                get_calls: Mutex::new(Vec::new()),
                set_calls: Mutex::new(Vec::new()),
                fail_set_for: Mutex::new(HashSet::new()),
            })
        }

        fn fail_set_for(&self, device_id: &str) {
            self.fail_set_for.lock().unwrap().insert(device_id.into());
        }

        fn set_calls(&self) -> Vec<(String, DeviceConfig)> {
            self.set_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NefClient for ScriptedNef {
        async fn get_device_config(&self, device: &Device) -> NefResult<DeviceConfig> {
            let id = device
                .network_access_identifier
                .as_ref()
                .unwrap()
                .as_str()
                .to_string();
            self.get_calls.lock().unwrap().push(id);
            Ok(DeviceConfig {
                max_latency: "100".into(),
                max_response_time: "200".into(),
            })
        }

        async fn set_device_config(&self, device: &Device, config: &DeviceConfig) -> NefResult<()> {
            let id = device
                .network_access_identifier
                .as_ref()
                .unwrap()
                .as_str()
                .to_string();
            if self.fail_set_for.lock().unwrap().contains(&id) {
                return Err(NefError::UnexpectedStatus {
                    status: 500,
                    body: "injected".into(),
                });
            }
            self.set_calls.lock().unwrap().push((id, config.clone()));
            Ok(())
        }
    }

    struct RecorderSender {
        events: Mutex<Vec<EventEnvelope>>,
    }

    impl RecorderSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn completions(&self) -> Vec<EventEnvelope> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.event_type == EventType::AllDevicesCompleted)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl EventSender for RecorderSender {
        async fn send(&self, envelope: EventEnvelope) -> Result<(), BusError> {
            self.events.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    fn subscription() -> SubscriptionRequest {
        SubscriptionRequest {
            protocol: Protocol::Http,
            sink: "http://cb".into(),
            sink_credential: None,
            types: vec![],
        }
    }

    fn device(id: &str) -> Device {
        Device {
            phone_number: Some("+11111".into()),
            network_access_identifier: Some(NetworkAccessIdentifier::new(id)),
            ..Device::default()
        }
    }

    async fn seed_transaction(
        store: &MemoryStore,
        device_ids: &[&str],
        enabled: bool,
        end_at: Option<chrono::DateTime<Utc>>,
    ) -> Transaction {
        let devices = device_ids
            .iter()
            .map(|id| TransactionDevice::new(NetworkAccessIdentifier::new(*id), device(id)))
            .collect();
        let tx = Transaction::new(
            TransactionId::generate(),
            Utc::now(),
            end_at,
            enabled,
            subscription(),
            devices,
        );
        store.create_transaction(tx.clone()).await.unwrap();
        tx
    }

    fn actuation_envelope(
        tx: &Transaction,
        device_id: &str,
        index: usize,
        action: Action,
        enabled: bool,
    ) -> EventEnvelope {
        let data = DeviceActuationRequestData {
            device: device(device_id),
            enabled,
            transaction_id: tx.transaction_id,
            action,
            subscription_request: subscription(),
        };
        EventEnvelope::new(
            actuation_event_id(tx.transaction_id, action, index),
            EventType::DeviceActuationRequest,
            EventSource::Scheduler,
            tx.transaction_id.to_string(),
            &data,
        )
        .unwrap()
    }

    fn worker(
        store: &Arc<MemoryStore>,
        nef: &Arc<ScriptedNef>,
        sender: &Arc<RecorderSender>,
    ) -> ActuationWorker {
        ActuationWorker::new(
            Arc::clone(store) as Arc<dyn Store>,
            Arc::clone(nef) as Arc<dyn NefClient>,
            Arc::clone(sender) as Arc<dyn EventSender>,
            PowerSavingConfig {
                max_latency: "1".into(),
                max_response_time: "1".into(),
            },
        )
    }

    #[tokio::test]
    async fn start_enabled_captures_then_applies() {
        let store = Arc::new(MemoryStore::new());
        let nef = ScriptedNef::new();
        let sender = RecorderSender::new();
        let worker = worker(&store, &nef, &sender);

        let tx = seed_transaction(&store, &["a@nai"], true, None).await;
        worker
            .handle(actuation_envelope(&tx, "a@nai", 0, Action::Start, true))
            .await
            .unwrap();

        // Original captured before the power-saving write.
        let original = store
            .get_original_state(&NetworkAccessIdentifier::new("a@nai"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.max_latency, "100");
        assert_eq!(original.max_response_time, "200");

        let sets = nef.set_calls();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].1.max_latency, "1");

        // Single device: the phase completes and the transaction is done.
        assert_eq!(sender.completions().len(), 1);
        let stored = store
            .get_transaction(tx.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert!(stored.start_action_completed);
    }

    #[tokio::test]
    async fn end_of_enabled_window_restores_original() {
        let store = Arc::new(MemoryStore::new());
        let nef = ScriptedNef::new();
        let sender = RecorderSender::new();
        let worker = worker(&store, &nef, &sender);

        store
            .upsert_original_state(DeviceOriginalState {
                device_id: NetworkAccessIdentifier::new("a@nai"),
                max_latency: "100".into(),
                max_response_time: "200".into(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let tx = seed_transaction(
            &store,
            &["a@nai"],
            true,
            Some(Utc::now() + chrono::Duration::seconds(5)),
        )
        .await;

        // The scheduler inverts `enabled` for the end phase: the worker sees
        // enabled=false and restores.
        worker
            .handle(actuation_envelope(&tx, "a@nai", 0, Action::End, false))
            .await
            .unwrap();

        let sets = nef.set_calls();
        assert_eq!(sets[0].1.max_latency, "100");
        assert_eq!(sets[0].1.max_response_time, "200");

        // End phase done: transaction completed.
        let stored = store
            .get_transaction(tx.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn restore_without_capture_fails_the_device() {
        let store = Arc::new(MemoryStore::new());
        let nef = ScriptedNef::new();
        let sender = RecorderSender::new();
        let worker = worker(&store, &nef, &sender);

        let tx = seed_transaction(&store, &["a@nai"], false, None).await;
        worker
            .handle(actuation_envelope(&tx, "a@nai", 0, Action::Start, false))
            .await
            .unwrap();

        // No write happened and the action failed.
        assert!(nef.set_calls().is_empty());
        let stored = store
            .get_transaction(tx.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.devices[0].start_action.as_ref().unwrap().status,
            ActionState::Failed
        );
        // The phase still completes with the failed device.
        assert_eq!(sender.completions().len(), 1);
        assert_eq!(stored.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn partial_failure_completes_with_mixed_statuses() {
        let store = Arc::new(MemoryStore::new());
        let nef = ScriptedNef::new();
        nef.fail_set_for("b@nai");
        let sender = RecorderSender::new();
        let worker = worker(&store, &nef, &sender);

        let tx = seed_transaction(&store, &["a@nai", "b@nai", "c@nai"], true, None).await;
        for (index, id) in ["a@nai", "b@nai", "c@nai"].iter().enumerate() {
            worker
                .handle(actuation_envelope(&tx, id, index, Action::Start, true))
                .await
                .unwrap();
        }

        let stored = store
            .get_transaction(tx.transaction_id)
            .await
            .unwrap()
            .unwrap();
        let statuses: Vec<ActionState> = stored
            .devices
            .iter()
            .map(|d| d.start_action.as_ref().unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                ActionState::Success,
                ActionState::Failed,
                ActionState::Success
            ]
        );

        // Exactly one completion event despite three workers finishing.
        assert_eq!(sender.completions().len(), 1);
        assert_eq!(stored.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn redelivery_does_not_reactuate_or_renotify() {
        let store = Arc::new(MemoryStore::new());
        let nef = ScriptedNef::new();
        let sender = RecorderSender::new();
        let worker = worker(&store, &nef, &sender);

        let tx = seed_transaction(&store, &["a@nai"], true, None).await;
        let envelope = actuation_envelope(&tx, "a@nai", 0, Action::Start, true);

        worker.handle(envelope.clone()).await.unwrap();
        worker.handle(envelope.clone()).await.unwrap();
        worker.handle(envelope).await.unwrap();

        // One capture, one apply, one completion event.
        assert_eq!(nef.get_calls.lock().unwrap().len(), 1);
        assert_eq!(nef.set_calls().len(), 1);
        assert_eq!(sender.completions().len(), 1);
    }

    #[tokio::test]
    async fn start_with_scheduled_end_does_not_complete_transaction() {
        let store = Arc::new(MemoryStore::new());
        let nef = ScriptedNef::new();
        let sender = RecorderSender::new();
        let worker = worker(&store, &nef, &sender);

        let tx = seed_transaction(
            &store,
            &["a@nai"],
            true,
            Some(Utc::now() + chrono::Duration::seconds(5)),
        )
        .await;
        worker
            .handle(actuation_envelope(&tx, "a@nai", 0, Action::Start, true))
            .await
            .unwrap();

        assert_eq!(sender.completions().len(), 1);
        let stored = store
            .get_transaction(tx.transaction_id)
            .await
            .unwrap()
            .unwrap();
        // The window is still open; only the end phase terminates it.
        assert_ne!(stored.status, TransactionStatus::Completed);
        assert!(stored.start_action_completed);
        assert!(!stored.end_action_completed);
    }
}
