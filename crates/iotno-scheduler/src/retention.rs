//! Background retention of terminal transactions.
//!
//! Completed and failed transactions are kept for the configured retention
//! period after their last update, then deleted by a periodic sweep. The
//! sweep runs once at startup and then on every tick.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tokio::sync::watch;

use iotno_core::config::RetentionConfig;
use iotno_store::Store;

/// Periodic cleanup of old terminal transactions.
pub struct RetentionWorker {
    store: Arc<dyn Store>,
    config: RetentionConfig,
    shutdown: watch::Receiver<bool>,
}

impl RetentionWorker {
    /// Creates a retention worker bound to the given shutdown signal.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        config: RetentionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            shutdown,
        }
    }

    /// Runs the cleanup loop until shutdown.
    pub async fn run(mut self) {
        tracing::info!(
            interval_secs = self.config.cleanup_interval.as_secs(),
            retention_secs = self.config.period.as_secs(),
            "retention worker started"
        );

        self.run_cleanup().await;

        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately; the startup
        // sweep already covered it.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    tracing::debug!("retention worker stopping");
                    break;
                }

                _ = ticker.tick() => {
                    self.run_cleanup().await;
                }
            }
        }
    }

    async fn run_cleanup(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.period)
                .unwrap_or_else(|_| chrono::Duration::hours(168));

        tracing::debug!(cutoff = %cutoff, "running transaction cleanup");

        match self.store.delete_old_transactions(cutoff).await {
            Ok(0) => tracing::debug!("cleanup completed, no old transactions to delete"),
            Ok(deleted) => {
                counter!("iotno_scheduler_transactions_cleaned_total").increment(deleted);
                tracing::info!(deleted, "cleanup completed");
            }
            Err(e) => tracing::error!(error = %e, "failed to delete old transactions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use iotno_core::subscription::{Protocol, SubscriptionRequest};
    use iotno_core::{Device, NetworkAccessIdentifier, TransactionId};
    use iotno_store::memory::MemoryStore;
    use iotno_store::model::{Transaction, TransactionDevice, TransactionStatus};

    fn terminal_transaction(age_days: i64) -> Transaction {
        let mut tx = Transaction::new(
            TransactionId::generate(),
            Utc::now(),
            None,
            true,
            SubscriptionRequest {
                protocol: Protocol::Http,
                sink: "http://cb".into(),
                sink_credential: None,
                types: vec![],
            },
            vec![TransactionDevice::new(
                NetworkAccessIdentifier::new("a@nai"),
                Device::from_phone_number("+1"),
            )],
        );
        tx.status = TransactionStatus::Completed;
        tx.updated_at = Utc::now() - chrono::Duration::days(age_days);
        tx
    }

    #[tokio::test(start_paused = true)]
    async fn startup_sweep_removes_expired_transactions() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_transaction(terminal_transaction(10))
            .await
            .unwrap();
        store
            .create_transaction(terminal_transaction(0))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = RetentionWorker::new(
            store.clone() as Arc<dyn Store>,
            RetentionConfig {
                period: Duration::from_secs(7 * 24 * 3600),
                cleanup_interval: Duration::from_secs(3600),
            },
            shutdown_rx,
        );

        let handle = tokio::spawn(worker.run());

        // Let the startup sweep run, then stop the loop.
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.transaction_count().unwrap(), 1);
    }
}
