//! Service-specific error types
//!
//! Startup failures go through `anyhow`. Per-request failures become an
//! `Error` and are rendered as the JSON error envelope.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use key_pool::{FailureKind, InvokeFailure};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{}", .failure.user_message)]
    Generation {
        failure: InvokeFailure,
        request_id: String,
    },
}

/// HTTP status for a failed generation.
pub fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::QuotaExceededLocally | FailureKind::Quota | FailureKind::RateLimit => {
            StatusCode::TOO_MANY_REQUESTS
        }
        FailureKind::NoCredentialAvailable | FailureKind::InvalidCredential => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FailureKind::Network | FailureKind::Unknown => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({
                    "success": false,
                    "error_kind": "invalid_request",
                    "user_message": message,
                    "user_retryable": false,
                })),
            )
                .into_response(),
            Error::Generation {
                failure,
                request_id,
            } => {
                let status = status_for(failure.kind);
                let retry_after = failure.retry_after_secs;
                let mut response = (
                    status,
                    axum::Json(serde_json::json!({
                        "success": false,
                        "error_kind": failure.kind,
                        "user_message": failure.user_message,
                        "suggestion": failure.suggestion,
                        "retry_after_secs": failure.retry_after_secs,
                        "user_retryable": failure.user_retryable,
                        "request_id": request_id,
                    })),
                )
                    .into_response();
                if let Some(secs) = retry_after {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                }
                response
            }
        }
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: FailureKind, retry_after_secs: Option<u64>) -> InvokeFailure {
        InvokeFailure {
            kind,
            user_message: "The free trial allowance has been used up".into(),
            suggestion: "Please try again in 1 hour".into(),
            retry_after_secs,
            user_retryable: false,
        }
    }

    #[test]
    fn status_mapping_per_kind() {
        assert_eq!(
            status_for(FailureKind::QuotaExceededLocally),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(status_for(FailureKind::Quota), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            status_for(FailureKind::RateLimit),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(FailureKind::NoCredentialAvailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(FailureKind::InvalidCredential),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(FailureKind::Network), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(FailureKind::Unknown), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn generation_error_sets_retry_after() {
        let err = Error::Generation {
            failure: failure(FailureKind::Quota, Some(3600)),
            request_id: "req_abc".into(),
        };
        assert_eq!(err.to_string(), "The free trial allowance has been used up");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3600");
    }

    #[tokio::test]
    async fn envelope_carries_retry_guidance() {
        let mut retryable = failure(FailureKind::Network, Some(5));
        retryable.user_retryable = true;
        let response = Error::Generation {
            failure: retryable,
            request_id: "req_abc".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "network");
        assert_eq!(json["user_retryable"], true);
        assert_eq!(json["retry_after_secs"], 5);
        assert_eq!(json["request_id"], "req_abc");
    }

    #[test]
    fn no_retry_after_header_without_hint() {
        let err = Error::Generation {
            failure: failure(FailureKind::NoCredentialAvailable, None),
            request_id: "req_abc".into(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn invalid_request_is_bad_request() {
        let response = Error::InvalidRequest("expected a JSON object".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
