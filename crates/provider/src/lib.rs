//! Provider abstraction for the upstream generation API
//!
//! Defines the `Provider` trait that decouples call orchestration from the
//! actual network call. The orchestrator hands a provider one credential and
//! one payload per attempt; the provider either returns the upstream JSON or
//! an `UpstreamError` carrying the status and message the classifier inspects.

pub mod http;

pub use http::{HttpProvider, HttpProviderConfig};

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Raw failure from an upstream call, before classification.
///
/// Carries the provider's own text. It is logged for operators but never
/// shown to end users; the classifier turns it into user-safe messaging.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Upstream answered with a non-success HTTP status.
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never completed (timeout, DNS, refused connection).
    #[error("transport error: {0}")]
    Transport(String),

    /// Anything else raised by the provider (bad response body, client setup).
    #[error("upstream error: {0}")]
    Other(String),
}

impl UpstreamError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// HTTP status, when the upstream produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The provider's message text.
    pub fn message(&self) -> &str {
        match self {
            Self::Status { message, .. } => message,
            Self::Transport(message) | Self::Other(message) => message,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// The external generation call.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Provider>`).
pub trait Provider: Send + Sync {
    /// Identifier for logging (e.g. "http")
    fn id(&self) -> &str;

    /// Perform one generation call with the given credential.
    ///
    /// Implementations must not retry internally; retries and credential
    /// rotation belong to the orchestrator.
    fn generate<'a>(
        &'a self,
        credential: &'a Secret<String>,
        payload: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>>;
}
