//! API server wiring: state, router, and listener.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Router, middleware};
use tower_http::trace::TraceLayer;

use iotno_bus::EventSender;
use iotno_core::NaiResolver;
use iotno_store::Store;

use crate::auth;
use crate::routes;

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Transaction and original-state store.
    pub store: Arc<dyn Store>,
    /// Broker publish side.
    pub sender: Arc<dyn EventSender>,
    /// Device-identifier resolution backend.
    pub resolver: Arc<dyn NaiResolver>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Builds the API router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/features/power-saving", post(routes::activate_power_saving))
        .route(
            "/features/power-saving/transactions/{transaction_id}",
            get(routes::get_power_saving),
        )
        .route("/healthz", get(routes::healthz))
        .layer(middleware::from_fn(auth::jwt_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds the listener and serves until the server fails.
///
/// # Errors
///
/// Returns an error when binding or serving fails.
pub async fn serve(address: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!(address = %address, "API server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
