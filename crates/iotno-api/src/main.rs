//! `iotno-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the admission
//! HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use iotno_api::server::{AppState, serve};
use iotno_bus::http::HttpSender;
use iotno_core::config::{ApiConfig, BrokerConfig, DatabaseConfig, LogConfig};
use iotno_core::device::HashingResolver;
use iotno_core::observability::init_logging;
use iotno_store::memory::MemoryStore;
use iotno_store::postgres::PostgresStore;
use iotno_store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env();
    init_logging(&log_config);

    let api_config = ApiConfig::from_env();
    let database_config = DatabaseConfig::from_env();
    let broker_config = BrokerConfig::from_env();

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

    let state = AppState {
        store,
        sender,
        resolver: Arc::new(HashingResolver::new()),
    };

    serve(&api_config.address, state).await
}
