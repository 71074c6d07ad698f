//! In-process bus with per-subscription type filters.
//!
//! Each subscription names the event types it wants; publish fans the
//! envelope out to every matching subscription on a spawned task. This
//! mirrors the delivery semantics the services see from a real broker:
//! asynchronous, possibly concurrent, unordered.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use iotno_core::{EventEnvelope, EventType};

use crate::{BusError, EventHandler, EventSender, Result};

struct Subscription {
    name: String,
    types: Vec<EventType>,
    handler: Arc<dyn EventHandler>,
}

/// In-process, type-filtered event bus.
#[derive(Default)]
pub struct InMemoryBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

fn poison_err<T>(_: PoisonError<T>) -> BusError {
    BusError::publish("subscription lock poisoned")
}

impl InMemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named subscription for the given event types.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription lock is poisoned.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().map_err(poison_err)?;
        subscriptions.push(Subscription {
            name: name.into(),
            types: types.to_vec(),
            handler,
        });
        Ok(())
    }

    /// Returns the number of registered subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription lock is poisoned.
    pub fn subscription_count(&self) -> Result<usize> {
        Ok(self.subscriptions.read().map_err(poison_err)?.len())
    }
}

#[async_trait]
impl EventSender for InMemoryBus {
    async fn send(&self, envelope: EventEnvelope) -> Result<()> {
        let matching: Vec<(String, Arc<dyn EventHandler>)> = {
            let subscriptions = self.subscriptions.read().map_err(poison_err)?;
            subscriptions
                .iter()
                .filter(|s| s.types.contains(&envelope.event_type))
                .map(|s| (s.name.clone(), Arc::clone(&s.handler)))
                .collect()
        };

        tracing::debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            subscribers = matching.len(),
            "dispatching event"
        );

        for (name, handler) in matching {
            let envelope = envelope.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(envelope.clone()).await {
                    tracing::error!(
                        subscription = %name,
                        event_id = %envelope.id,
                        event_type = %envelope.event_type,
                        error = %e,
                        "event handler failed"
                    );
                }
            });
        }

        Ok(())
    }
}
