//! `iotno-worker` binary entrypoint.
//!
//! Consumes `device.actuation.request` deliveries over the broker's HTTP
//! receiver and actuates devices through the configuration backend.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use iotno_bus::http::{HttpSender, serve_receiver};
use iotno_core::config::{ApiConfig, BrokerConfig, DatabaseConfig, LogConfig, NefConfig, PowerSavingConfig};
use iotno_core::observability::init_logging;
use iotno_nef::http::HttpNefClient;
use iotno_nef::{NefClient, StubNefClient};
use iotno_store::Store;
use iotno_store::memory::MemoryStore;
use iotno_store::postgres::PostgresStore;
use iotno_worker::ActuationWorker;

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env();
    init_logging(&log_config);

    let api_config = ApiConfig::from_env();
    let database_config = DatabaseConfig::from_env();
    let broker_config = BrokerConfig::from_env();
    let nef_config = NefConfig::from_env();
    let power_saving = PowerSavingConfig::from_env();

    tracing::info!(
        max_latency = %power_saving.max_latency,
        max_response_time = %power_saving.max_response_time,
        "starting actuation worker"
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

    let nef: Arc<dyn NefClient> = match nef_config.base_url.as_deref() {
        Some(base_url) => {
            tracing::info!(base_url = %base_url, "using HTTP device-configuration backend");
            Arc::new(HttpNefClient::new(base_url)?)
        }
        None => {
            tracing::warn!("EASYAPI_BASE_URL not set; using stub device-configuration backend");
            Arc::new(StubNefClient::new())
        }
    };

    let sink = broker_config.require_sink()?;
    let sender = Arc::new(HttpSender::new(sink)?);

    let worker = Arc::new(ActuationWorker::new(store, nef, sender, power_saving));

    serve_receiver(&api_config.address, worker).await?;
    Ok(())
}
