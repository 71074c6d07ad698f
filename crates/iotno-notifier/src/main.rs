//! `iotno-notifier` binary entrypoint.
//!
//! Consumes `all-devices.completed` and `notify.error.requested` deliveries
//! over the broker's HTTP receiver and posts subscriber callbacks.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use iotno_bus::http::serve_receiver;
use iotno_core::config::{ApiConfig, DatabaseConfig, HttpClientConfig, LogConfig};
use iotno_core::observability::init_logging;
use iotno_notifier::NotificationWorker;
use iotno_store::Store;
use iotno_store::memory::MemoryStore;
use iotno_store::postgres::PostgresStore;

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env();
    init_logging(&log_config);

    let api_config = ApiConfig::from_env();
    let database_config = DatabaseConfig::from_env();
    let http_config = HttpClientConfig::from_env()?;

    tracing::info!("starting notification worker");

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

    let worker = Arc::new(NotificationWorker::new(store, http_config));

    serve_receiver(&api_config.address, worker).await?;
    Ok(())
}
