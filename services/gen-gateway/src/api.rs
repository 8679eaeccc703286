//! Public API handlers
//!
//! - POST /v1/generate  run one admitted, pooled generation call
//! - GET  /v1/quota     today's local quota usage

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use key_pool::{InvokeOutcome, QuotaSnapshot};
use tracing::{Span, info, instrument};

use crate::AppState;
use crate::error::{Error, Result};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Decrements the in-flight gauge when the request finishes, however it ends.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// POST /v1/generate
///
/// The body is forwarded to the provider as-is once admitted. Failures carry
/// only classified, user-safe text and map to 429/503/502. Every response,
/// error or not, carries `x-request-id`.
#[instrument(skip_all, fields(request_id))]
pub async fn generate(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    Span::current().record("request_id", request_id.as_str());

    let started = Instant::now();
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.stats.in_flight);

    let result = run_generate(&state, &body, &request_id).await;

    let outcome = match &result {
        Ok(_) => "success",
        Err(Error::InvalidRequest(_)) => "invalid_request",
        Err(Error::Generation { failure, .. }) => failure.kind.label(),
    };
    if result.is_err() {
        state.stats.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    let elapsed = started.elapsed();
    crate::metrics::record_request(outcome, elapsed.as_secs_f64());
    info!(
        outcome,
        duration_ms = elapsed.as_millis() as u64,
        "request completed"
    );

    let mut response = result.unwrap_or_else(IntoResponse::into_response);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn run_generate(state: &AppState, body: &[u8], request_id: &str) -> Result<Response> {
    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidRequest(format!("body is not valid JSON: {e}")))?;
    if !payload.is_object() {
        return Err(Error::InvalidRequest(
            "body must be a JSON object".into(),
        ));
    }

    match state.orchestrator.invoke(&payload).await {
        InvokeOutcome::Success {
            data,
            credential_preview,
            attempts,
        } => {
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "data": data,
                    "used_credential": credential_preview,
                    "attempts": attempts,
                    "request_id": request_id,
                })),
            )
                .into_response())
        }
        InvokeOutcome::Failure(failure) => Err(Error::Generation {
            failure,
            request_id: request_id.to_string(),
        }),
    }
}

/// GET /v1/quota
pub async fn quota(State(state): State<AppState>) -> Json<QuotaSnapshot> {
    Json(state.orchestrator.ledger().snapshot(Utc::now()).await)
}
