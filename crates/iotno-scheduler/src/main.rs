//! `iotno-scheduler` binary entrypoint.
//!
//! Rehydrates timers from the store, starts the retention loop, and
//! consumes `schedule.requested` and `all-devices.completed` deliveries
//! over the broker's HTTP receiver.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use iotno_bus::http::{HttpSender, serve_receiver};
use iotno_core::config::{ApiConfig, BrokerConfig, DatabaseConfig, LogConfig};
use iotno_core::observability::init_logging;
use iotno_scheduler::retention::RetentionWorker;
use iotno_scheduler::{Scheduler, SchedulerConfig};
use iotno_store::Store;
use iotno_store::memory::MemoryStore;
use iotno_store::postgres::PostgresStore;

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env();
    init_logging(&log_config);

    let api_config = ApiConfig::from_env();
    let database_config = DatabaseConfig::from_env();
    let broker_config = BrokerConfig::from_env();
    let scheduler_config = SchedulerConfig::from_env()?;

    tracing::info!(
        workers = scheduler_config.worker_count,
        retention_secs = scheduler_config.retention.period.as_secs(),
        cleanup_interval_secs = scheduler_config.retention.cleanup_interval.as_secs(),
        "starting scheduler"
    );

    let store: Arc<dyn Store> = match database_config.uri.as_deref() {
        Some(uri) => {
            tracing::info!(database = %database_config.name, "using Postgres store");
            Arc::new(PostgresStore::connect(uri).await?)
        }
        None => {
            tracing::warn!("DB_URI not set; using in-memory store (development only)");
            Arc::new(MemoryStore::new())
        }
    };

    let sink = broker_config.require_sink()?;
    let sender = Arc::new(HttpSender::new(sink)?);

    let scheduler = Scheduler::new(Arc::clone(&store), sender, &scheduler_config);

    // Timers for anything already persisted; new schedules work regardless.
    if let Err(e) = scheduler.rehydrate().await {
        tracing::error!(error = %e, "failed to load pending schedules on startup");
    }

    tokio::spawn(
        RetentionWorker::new(
            store,
            scheduler_config.retention.clone(),
            scheduler.shutdown_signal(),
        )
        .run(),
    );

    let handler = Arc::clone(&scheduler) as Arc<dyn iotno_bus::EventHandler>;
    let server = tokio::spawn({
        let address = api_config.address.clone();
        async move { serve_receiver(&address, handler).await }
    });

    tokio::signal::ctrl_c().await?;
    scheduler.shutdown();
    server.abort();

    Ok(())
}
