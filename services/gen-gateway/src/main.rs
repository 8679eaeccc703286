//! Generation gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of API keys and a local daily quota
//! 2. Admits each generation request against the quota
//! 3. Calls the upstream with the next healthy key, retrying on another key
//! 4. Quarantines keys that hit quota or are rejected

mod admin;
mod api;
mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::Utc;
use key_pool::{CredentialPool, FileStore, KeyValueStore, MemoryStore, Orchestrator, QuotaLedger};
use provider::{HttpProvider, Provider};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;

/// Process-lifetime request counters reported by /health.
#[derive(Clone)]
struct ServiceStats {
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    /// Requests currently being processed, reported if the drain times out.
    in_flight: Arc<AtomicU64>,
    started_at: Instant,
}

impl ServiceStats {
    fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    stats: ServiceStats,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit layer caps simultaneous requests at `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/generate", post(api::generate))
        .route("/v1/quota", get(api::quota))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(admin::routes())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gen-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.upstream.url,
        credentials = config.credentials.len(),
        daily_limit = config.quota.daily_limit,
        min_interval_secs = config.quota.min_interval_secs,
        "configuration loaded"
    );

    let store: Arc<dyn KeyValueStore> = match &config.quota.store_path {
        Some(path) => Arc::new(
            FileStore::open(path.clone())
                .await
                .with_context(|| format!("failed to open quota store {}", path.display()))?,
        ),
        None => {
            warn!("no quota.store_path configured, quota usage resets on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let ledger = Arc::new(QuotaLedger::new(store, config.quota.to_quota_config()));
    match ledger.cleanup_expired(Utc::now()).await {
        Ok(removed) if removed > 0 => info!(removed, "removed expired quota records"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to clean up expired quota records"),
    }

    let pool = Arc::new(CredentialPool::new(
        config.credentials,
        config.pool.to_pool_config(),
    ));

    let provider: Arc<dyn Provider> = Arc::new(HttpProvider::new(
        reqwest::Client::new(),
        config.upstream.to_provider_config(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        ledger,
        pool,
        provider,
        config.retry.to_policy(),
    ));

    let stats = ServiceStats::new();
    let in_flight = stats.in_flight.clone();

    let app_state = AppState {
        orchestrator,
        stats,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: the server is
    // told to drain, then the drain is raced against the timeout.
    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: JSON with pool state, quota, uptime, and request counters.
/// Returns 200 while at least one credential is available, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let pool = state.orchestrator.pool().status(now).await;
    let quota_remaining = state.orchestrator.ledger().remaining(now).await;
    let uptime = state.stats.started_at.elapsed().as_secs();
    let requests = state.stats.requests_total.load(Ordering::Relaxed);
    let errors = state.stats.errors_total.load(Ordering::Relaxed);

    let status_code = if pool.available > 0 {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": pool.status,
        "credentials_total": pool.total,
        "credentials_available": pool.available,
        "credentials_quarantined": pool.quarantined,
        "quota_remaining": quota_remaining,
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::TimeDelta;
    use common::Secret;
    use key_pool::{PoolConfig, QuotaConfig, RetryPolicy};
    use provider::{HttpProviderConfig, UpstreamError};
    use std::future::Future;
    use std::pin::Pin;
    use tower::ServiceExt;

    const KEY_A: &str = "AIzaSyAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAaaaa";
    const KEY_B: &str = "AIzaSyBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBbbbb";

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// Provider whose response depends on which key it was given.
    struct KeyedProvider {
        failing_key: Option<(&'static str, UpstreamError)>,
    }

    impl Provider for KeyedProvider {
        fn id(&self) -> &str {
            "keyed"
        }

        fn generate<'a>(
            &'a self,
            credential: &'a Secret<String>,
            payload: &'a serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = provider::Result<serde_json::Value>> + Send + 'a>>
        {
            Box::pin(async move {
                match &self.failing_key {
                    Some((key, err)) if credential.expose().as_str() == *key => Err(err.clone()),
                    _ => Ok(serde_json::json!({ "echo": payload })),
                }
            })
        }
    }

    fn test_app_state(
        keys: &[&str],
        daily_limit: u32,
        provider: Arc<dyn Provider>,
    ) -> AppState {
        let ledger = Arc::new(QuotaLedger::new(
            Arc::new(MemoryStore::new()),
            QuotaConfig {
                daily_limit,
                min_interval: TimeDelta::zero(),
            },
        ));
        let pool = Arc::new(CredentialPool::new(
            keys.iter().map(|k| Secret::from(*k)).collect(),
            PoolConfig::default(),
        ));
        AppState {
            orchestrator: Arc::new(Orchestrator::new(
                ledger,
                pool,
                provider,
                RetryPolicy {
                    max_attempts: 2,
                    max_retry_delay: Duration::from_millis(10),
                },
            )),
            stats: ServiceStats::new(),
            prometheus: test_prometheus_handle(),
        }
    }

    fn ok_provider() -> Arc<dyn Provider> {
        Arc::new(KeyedProvider { failing_key: None })
    }

    fn generate_request(body: &str) -> Request<Body> {
        Request::builder()
            .uri("/v1/generate")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Start a mock upstream that echoes the API key header and body as JSON.
    async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}/generate");

        let handle = tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/generate",
                post(
                    |headers: axum::http::HeaderMap, axum::Json(body): axum::Json<serde_json::Value>| async move {
                        let key = headers
                            .get("x-goog-api-key")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        axum::Json(serde_json::json!({ "key": key, "body": body }))
                    },
                ),
            );
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let state = test_app_state(&[KEY_A, KEY_B], 5, ok_provider());
        state
            .stats
            .requests_total
            .fetch_add(5, std::sync::atomic::Ordering::Relaxed);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["credentials_available"], 2);
        assert_eq!(json["quota_remaining"], 5);
        assert_eq!(json["requests_served"], 5);
    }

    #[tokio::test]
    async fn health_is_unavailable_with_empty_pool() {
        let state = test_app_state(&[], 5, ok_provider());
        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn generate_success_returns_data_and_preview() {
        let state = test_app_state(&[KEY_A], 5, ok_provider());
        let app = build_router(state, 1000);

        let response = app
            .oneshot(generate_request(r#"{"prompt":"a lighthouse"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(request_id.starts_with("req_"));

        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["echo"]["prompt"], "a lighthouse");
        assert_eq!(json["used_credential"], "AIzaSyAAAA...aaaa");
        assert_eq!(json["request_id"], request_id.as_str());
        assert!(
            !json.to_string().contains(KEY_A),
            "full key must never appear in a response"
        );
    }

    #[tokio::test]
    async fn generate_over_local_quota_is_429() {
        let state = test_app_state(&[KEY_A], 1, ok_provider());
        let app = build_router(state, 1000);

        let first = app
            .clone()
            .oneshot(generate_request("{}"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(generate_request("{}")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().get("retry-after").is_some());
        let request_id = second
            .headers()
            .get(api::REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        let json = body_json(second).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "quota_exceeded_locally");
        assert_eq!(json["user_retryable"], false);
        assert_eq!(json["request_id"], request_id.as_str());
    }

    #[tokio::test]
    async fn generate_hides_upstream_text() {
        let provider = Arc::new(KeyedProvider {
            failing_key: Some((
                KEY_A,
                UpstreamError::http(400, "API key not valid. Please pass a valid API key. (INVALID_ARGUMENT)"),
            )),
        });
        let state = test_app_state(&[KEY_A], 5, provider);
        let app = build_router(state, 1000);

        let response = app.oneshot(generate_request("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "invalid_credential");
        assert!(!json.to_string().contains("INVALID_ARGUMENT"));
    }

    #[tokio::test]
    async fn generate_fails_over_to_next_key() {
        let provider = Arc::new(KeyedProvider {
            failing_key: Some((KEY_A, UpstreamError::http(429, "Resource has been exhausted"))),
        });
        let state = test_app_state(&[KEY_A, KEY_B], 5, provider);
        let app = build_router(state, 1000);

        let response = app
            .clone()
            .oneshot(generate_request("{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["used_credential"], "AIzaSyBBBB...bbbb");
        assert_eq!(json["attempts"], 2);

        let pool = app
            .oneshot(
                Request::builder()
                    .uri("/admin/pool")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(pool).await;
        assert_eq!(json["available"], 1);
        assert_eq!(json["quarantined"], 1);
        assert_eq!(json["credentials"][0]["last_failure_kind"], "quota");
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let state = test_app_state(&[KEY_A], 5, ok_provider());
        let app = build_router(state.clone(), 1000);

        let response = app.oneshot(generate_request("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key(api::REQUEST_ID_HEADER));
        let json = body_json(response).await;
        assert_eq!(json["error_kind"], "invalid_request");

        // A rejected body does not consume quota.
        assert_eq!(state.orchestrator.ledger().remaining(Utc::now()).await, 5);
    }

    #[tokio::test]
    async fn non_object_body_is_400() {
        let state = test_app_state(&[KEY_A], 5, ok_provider());
        let app = build_router(state, 1000);

        let response = app.oneshot(generate_request("[1,2,3]")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn quota_endpoint_reports_usage() {
        let state = test_app_state(&[KEY_A], 5, ok_provider());
        let app = build_router(state, 1000);

        let _ = app
            .clone()
            .oneshot(generate_request("{}"))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/quota")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["used"], 1);
        assert_eq!(json["limit"], 5);
        assert_eq!(json["remaining"], 4);
    }

    #[tokio::test]
    async fn admin_reset_clears_quarantine() {
        let provider = Arc::new(KeyedProvider {
            failing_key: Some((KEY_A, UpstreamError::http(403, "permission denied"))),
        });
        let state = test_app_state(&[KEY_A, KEY_B], 5, provider);
        let app = build_router(state, 1000);

        let _ = app
            .clone()
            .oneshot(generate_request("{}"))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/pool/reset")
                    .method("POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["available"], 2);
        assert_eq!(json["quarantined"], 0);
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn admin_pool_never_exposes_keys() {
        let state = test_app_state(&[KEY_A, KEY_B], 5, ok_provider());
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/admin/pool")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let text = body_json(response).await.to_string();
        assert!(!text.contains(KEY_A));
        assert!(!text.contains(KEY_B));
        assert!(text.contains("AIzaSyAAAA...aaaa"));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let state = test_app_state(&[KEY_A], 5, ok_provider());
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn end_to_end_through_http_provider() {
        let (upstream_url, _server) = start_echo_server().await;

        let provider: Arc<dyn Provider> = Arc::new(HttpProvider::new(
            reqwest::Client::new(),
            HttpProviderConfig {
                endpoint: upstream_url,
                api_key_header: "x-goog-api-key".into(),
                timeout: Duration::from_secs(5),
            },
        ));
        let state = test_app_state(&[KEY_A], 5, provider);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(generate_request(r#"{"contents":[{"parts":[{"text":"hi"}]}]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["key"], KEY_A, "key must reach upstream in the header");
        assert_eq!(json["data"]["body"]["contents"][0]["parts"][0]["text"], "hi");
    }
}
