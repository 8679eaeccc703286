//! Call orchestration: admission, credential selection, bounded retries
//!
//! One `invoke` consumes one unit of the local quota, then makes at most
//! `max_attempts` upstream calls. Every outcome is reported to the pool before
//! `invoke` returns, so pool state stays consistent whether or not the caller
//! inspects the result. Failures surface only classified, user-safe text.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use provider::Provider;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classify::{self, ClassifiedError, ErrorKind};
use crate::ledger::{Admission, QuotaLedger};
use crate::pool::{CredentialId, CredentialPool};

/// Retry budget for one `invoke`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Upper bound on the wait between attempts, whatever the classifier suggests.
    pub max_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Every way an `invoke` can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Quota,
    RateLimit,
    InvalidCredential,
    Network,
    Unknown,
    /// Refused by the local ledger; no call was made.
    QuotaExceededLocally,
    /// The pool had nothing to hand out.
    NoCredentialAvailable,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Quota => "quota",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::InvalidCredential => "invalid_credential",
            FailureKind::Network => "network",
            FailureKind::Unknown => "unknown",
            FailureKind::QuotaExceededLocally => "quota_exceeded_locally",
            FailureKind::NoCredentialAvailable => "no_credential_available",
        }
    }
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Quota => FailureKind::Quota,
            ErrorKind::RateLimit => FailureKind::RateLimit,
            ErrorKind::InvalidCredential => FailureKind::InvalidCredential,
            ErrorKind::Network => FailureKind::Network,
            ErrorKind::Unknown => FailureKind::Unknown,
        }
    }
}

/// User-safe description of a failed invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvokeFailure {
    pub kind: FailureKind,
    pub user_message: String,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    pub user_retryable: bool,
}

impl From<ClassifiedError> for InvokeFailure {
    fn from(error: ClassifiedError) -> Self {
        Self {
            kind: error.kind.into(),
            user_message: error.user_message.to_string(),
            suggestion: error.suggestion,
            retry_after_secs: Some(error.suggested_retry_delay_secs),
            user_retryable: error.user_retryable,
        }
    }
}

/// Result of one `invoke`.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Success {
        data: serde_json::Value,
        /// Redacted preview of the credential that served the call.
        credential_preview: String,
        attempts: u32,
    },
    Failure(InvokeFailure),
}

impl InvokeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvokeOutcome::Success { .. })
    }

    /// Metrics/log label: "success" or the failure kind.
    pub fn label(&self) -> &'static str {
        match self {
            InvokeOutcome::Success { .. } => "success",
            InvokeOutcome::Failure(failure) => failure.kind.label(),
        }
    }
}

/// Glue between the ledger, the pool and the provider.
pub struct Orchestrator {
    ledger: Arc<QuotaLedger>,
    pool: Arc<CredentialPool>,
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        pool: Arc<CredentialPool>,
        provider: Arc<dyn Provider>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            pool,
            provider,
            policy,
        }
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Admit, then call upstream with bounded retries across credentials.
    ///
    /// A credential that failed with a quarantine-worthy error is never
    /// retried within the same invoke; if the pool can only offer that
    /// credential again, its failure is returned at once, without waiting
    /// out the retry delay.
    pub async fn invoke(&self, payload: &serde_json::Value) -> InvokeOutcome {
        let now = Utc::now();
        let admission = self.ledger.try_admit(now).await;
        if !admission.is_admitted() {
            return InvokeOutcome::Failure(local_quota_failure(admission, now));
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut hard_failed: Vec<CredentialId> = Vec::new();
        let mut last_failure: Option<ClassifiedError> = None;
        let mut pending_delay = Duration::ZERO;

        for attempt in 1..=max_attempts {
            let Some(lease) = self.pool.acquire(Utc::now()).await else {
                warn!(attempt, "no credential available");
                return InvokeOutcome::Failure(no_credential_failure());
            };

            if hard_failed.contains(&lease.id) {
                if let Some(classified) = last_failure {
                    info!(
                        credential = %lease.preview,
                        "no other credential to retry with, giving up"
                    );
                    return InvokeOutcome::Failure(classified.into());
                }
            }

            if !pending_delay.is_zero() {
                debug!(delay_ms = pending_delay.as_millis() as u64, "waiting before retry");
                tokio::time::sleep(pending_delay).await;
            }

            debug!(
                credential = %lease.preview,
                attempt,
                provider = self.provider.id(),
                degraded = lease.degraded,
                "calling upstream"
            );
            match self.provider.generate(&lease.secret, payload).await {
                Ok(data) => {
                    self.pool.report_success(lease.id).await;
                    info!(credential = %lease.preview, attempt, "upstream call succeeded");
                    return InvokeOutcome::Success {
                        data,
                        credential_preview: lease.preview,
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    let classified = classify::classify(&err);
                    warn!(
                        credential = %lease.preview,
                        attempt,
                        kind = classified.kind.label(),
                        error = %err,
                        "upstream call failed"
                    );
                    metrics::counter!(
                        "gateway_upstream_errors_total",
                        "kind" => classified.kind.label()
                    )
                    .increment(1);

                    self.pool
                        .report_failure(lease.id, &classified, Utc::now())
                        .await;
                    if classified.quarantine_worthy {
                        hard_failed.push(lease.id);
                    }

                    // Slept only once the next lease is known to be usable.
                    pending_delay = Duration::from_secs(classified.suggested_retry_delay_secs)
                        .min(self.policy.max_retry_delay);
                    last_failure = Some(classified);
                }
            }
        }

        let classified = last_failure.unwrap_or_else(|| {
            classify::from_kind(
                ErrorKind::Unknown,
                ErrorKind::Unknown.default_retry_delay_secs(),
            )
        });
        InvokeOutcome::Failure(classified.into())
    }
}

fn local_quota_failure(admission: Admission, now: DateTime<Utc>) -> InvokeFailure {
    match admission {
        Admission::DailyLimitReached { resets_at } => {
            let secs = seconds_until(resets_at, now);
            InvokeFailure {
                kind: FailureKind::QuotaExceededLocally,
                user_message: "Today's free allowance has been used up".into(),
                suggestion: format!(
                    "Your allowance resets in {} (at 00:00 UTC)",
                    classify::format_wait(secs)
                ),
                retry_after_secs: Some(secs),
                user_retryable: false,
            }
        }
        Admission::TooSoon { next_eligible_at } => {
            let secs = seconds_until(next_eligible_at, now);
            InvokeFailure {
                kind: FailureKind::QuotaExceededLocally,
                user_message: "Please wait a little before the next request".into(),
                suggestion: format!(
                    "You can send another request in {}",
                    classify::format_wait(secs)
                ),
                retry_after_secs: Some(secs),
                user_retryable: false,
            }
        }
        Admission::Admitted => InvokeFailure {
            kind: FailureKind::Unknown,
            user_message: ErrorKind::Unknown.user_message().into(),
            suggestion: "Please try again".into(),
            retry_after_secs: None,
            user_retryable: true,
        },
    }
}

fn no_credential_failure() -> InvokeFailure {
    InvokeFailure {
        kind: FailureKind::NoCredentialAvailable,
        user_message: "The service is temporarily unavailable".into(),
        suggestion: "No capacity is available right now, please try again later".into(),
        retry_after_secs: None,
        user_retryable: true,
    }
}

/// Whole seconds until `at`, rounded up, at least 1.
fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}
