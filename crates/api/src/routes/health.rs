use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the Result Store is reachable.
    pub store_healthy: bool,
    /// Whether the Job Queue is reachable.
    pub queue_healthy: bool,
}

/// GET /health -- returns service, store and queue health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (store, queue) = tokio::join!(state.store.ping(), state.queue.ping());
    let store_healthy = store.is_ok();
    let queue_healthy = queue.is_ok();

    let status = if store_healthy && queue_healthy {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        store_healthy,
        queue_healthy,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
