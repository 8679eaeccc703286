//! HTTP provider: posts the payload as JSON to a fixed endpoint
//!
//! The credential travels in a configurable header (`x-goog-api-key` by
//! default). Non-success responses become `UpstreamError::Status` with the
//! upstream's own error message extracted from the usual
//! `{"error":{"message":..,"status":..}}` envelope when present.

use crate::{Provider, Result, UpstreamError};
use common::Secret;
use reqwest::header::{HeaderName, HeaderValue};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Default header carrying the API key.
pub const DEFAULT_API_KEY_HEADER: &str = "x-goog-api-key";

/// Endpoint settings for `HttpProvider`.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub endpoint: String,
    pub api_key_header: String,
    pub timeout: Duration,
}

/// Provider performing one JSON POST per generation call.
pub struct HttpProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpProvider {
    pub fn new(client: reqwest::Client, config: HttpProviderConfig) -> Self {
        Self { client, config }
    }

    async fn call(
        &self,
        credential: &Secret<String>,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let name = HeaderName::from_str(&self.config.api_key_header)
            .map_err(|e| UpstreamError::other(format!("invalid api key header name: {e}")))?;
        let value = HeaderValue::from_str(credential.expose())
            .map_err(|_| UpstreamError::other("credential is not a valid header value"))?;

        let response = self
            .client
            .post(&self.config.endpoint)
            .header(name, value)
            .json(payload)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::transport(format!("request timeout: {e}"))
                } else if e.is_connect() {
                    UpstreamError::transport(format!("network connection failed: {e}"))
                } else {
                    UpstreamError::transport(format!("network error: {e}"))
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::transport(format!("response timeout: {e}"))
            } else {
                UpstreamError::transport(format!("network error reading response: {e}"))
            }
        })?;

        if !status.is_success() {
            debug!(status = status.as_u16(), "upstream returned error status");
            return Err(UpstreamError::http(status.as_u16(), error_message(&body)));
        }

        match serde_json::from_str(&body) {
            Ok(json) => Ok(json),
            Err(_) => Ok(serde_json::Value::String(body)),
        }
    }
}

impl Provider for HttpProvider {
    fn id(&self) -> &str {
        "http"
    }

    fn generate<'a>(
        &'a self,
        credential: &'a Secret<String>,
        payload: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>> {
        Box::pin(self.call(credential, payload))
    }
}

/// Pull the human-readable message out of an upstream error body.
///
/// Appends the symbolic status (e.g. `RESOURCE_EXHAUSTED`) when present since
/// the classifier keys on it. Falls back to the raw body.
fn error_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    let error = &json["error"];
    match (error["message"].as_str(), error["status"].as_str()) {
        (Some(message), Some(status)) => format!("{message} ({status})"),
        (Some(message), None) => message.to_string(),
        (None, Some(status)) => status.to_string(),
        (None, None) => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use tokio::net::TcpListener;

    /// Start a mock upstream. `/ok` echoes the api key header, `/quota` returns
    /// a 429 envelope, `/slow` stalls past any test timeout.
    async fn start_mock_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = axum::Router::new()
            .route(
                "/ok",
                post(|headers: HeaderMap, body: String| async move {
                    let key = headers
                        .get(DEFAULT_API_KEY_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    axum::Json(serde_json::json!({ "key": key, "body": body }))
                }),
            )
            .route(
                "/quota",
                post(|| async {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        r#"{"error":{"code":429,"message":"Quota exceeded for metric. Please retry in 37.5s.","status":"RESOURCE_EXHAUSTED"}}"#,
                    )
                }),
            )
            .route(
                "/plain",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route(
                "/slow",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{addr}")
    }

    fn provider(endpoint: String, timeout: Duration) -> HttpProvider {
        HttpProvider::new(
            reqwest::Client::new(),
            HttpProviderConfig {
                endpoint,
                api_key_header: DEFAULT_API_KEY_HEADER.into(),
                timeout,
            },
        )
    }

    #[tokio::test]
    async fn success_returns_json_and_sends_key_header() {
        let base = start_mock_upstream().await;
        let provider = provider(format!("{base}/ok"), Duration::from_secs(5));
        let key = Secret::from("AIzaSy-test-key");

        let result = provider
            .generate(&key, &serde_json::json!({ "prompt": "hi" }))
            .await
            .unwrap();

        assert_eq!(result["key"], "AIzaSy-test-key");
        assert!(result["body"].as_str().unwrap().contains("\"prompt\":\"hi\""));
    }

    #[tokio::test]
    async fn error_status_extracts_envelope_message() {
        let base = start_mock_upstream().await;
        let provider = provider(format!("{base}/quota"), Duration::from_secs(5));

        let err = provider
            .generate(&Secret::from("k"), &serde_json::Value::Null)
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(429));
        assert!(err.message().contains("Quota exceeded"));
        assert!(err.message().contains("RESOURCE_EXHAUSTED"));
    }

    #[tokio::test]
    async fn non_json_error_body_is_kept_verbatim() {
        let base = start_mock_upstream().await;
        let provider = provider(format!("{base}/plain"), Duration::from_secs(5));

        let err = provider
            .generate(&Secret::from("k"), &serde_json::Value::Null)
            .await
            .unwrap_err();

        assert_eq!(err, UpstreamError::http(500, "boom"));
    }

    #[tokio::test]
    async fn slow_upstream_is_a_transport_timeout() {
        let base = start_mock_upstream().await;
        let provider = provider(format!("{base}/slow"), Duration::from_millis(100));

        let err = provider
            .generate(&Secret::from("k"), &serde_json::Value::Null)
            .await
            .unwrap_err();

        assert!(err.is_transport(), "got: {err}");
        assert!(err.message().contains("timeout"), "got: {err}");
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = provider(format!("http://{addr}/ok"), Duration::from_secs(2));
        let err = provider
            .generate(&Secret::from("k"), &serde_json::Value::Null)
            .await
            .unwrap_err();

        assert!(err.is_transport(), "got: {err}");
    }

    #[test]
    fn error_message_variants() {
        assert_eq!(
            error_message(r#"{"error":{"message":"API key not valid"}}"#),
            "API key not valid"
        );
        assert_eq!(
            error_message(r#"{"error":{"status":"PERMISSION_DENIED"}}"#),
            "PERMISSION_DENIED"
        );
        assert_eq!(error_message("gateway down"), "gateway down");
        assert_eq!(error_message(r#"{"other":1}"#), r#"{"other":1}"#);
    }
}
