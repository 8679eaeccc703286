//! Admin API for pool inspection
//!
//! Endpoints:
//! - GET  /admin/pool        per-credential health (previews only)
//! - POST /admin/pool/reset  clear every quarantine and failure counter

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use chrono::Utc;
use key_pool::PoolStatus;
use tracing::{info, instrument};

use crate::AppState;

/// Admin routes, merged into the main router.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/pool/reset", post(reset_pool))
}

/// GET /admin/pool. Never exposes full keys.
async fn pool_status(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.orchestrator.pool().status(Utc::now()).await)
}

/// POST /admin/pool/reset. Returns the status after the reset.
#[instrument(skip_all)]
async fn reset_pool(State(state): State<AppState>) -> Json<PoolStatus> {
    let pool = state.orchestrator.pool();
    pool.reset_all().await;
    let status = pool.status(Utc::now()).await;
    info!(credentials = status.total, "pool reset by admin");
    Json(status)
}
