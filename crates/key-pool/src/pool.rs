//! Credential pool state machine and round-robin selection
//!
//! The pool holds a fixed list of credentials, each with its own health, and
//! hands them out round-robin starting from a cursor so load spreads evenly.
//! Membership never changes after construction; only health does.
//!
//! Per-credential states: `Available` and `Quarantined { until }`.
//! - Available → Quarantined: a quarantine-worthy failure, or the
//!   `failure_threshold`-th consecutive soft failure
//! - Quarantined → Available: `until` elapses (checked lazily), or any success
//!
//! All state sits behind one mutex. Operations are O(pool size) and never
//! await while holding it, so the external call always runs unlocked.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classify::{ClassifiedError, ErrorKind};

/// Stable handle for a credential: its position in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CredentialId(pub usize);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0 + 1)
    }
}

/// Pool tuning.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// How long a quarantined credential stays out of rotation.
    pub cooldown: TimeDelta,
    /// Consecutive soft failures that trigger quarantine.
    pub failure_threshold: u32,
    /// Hand out a quarantined credential when nothing else is left.
    pub fail_open: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: TimeDelta::minutes(5),
            failure_threshold: 3,
            fail_open: true,
        }
    }
}

/// Health of one credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialHealth {
    pub consecutive_failures: u32,
    /// Set iff the credential is currently out of rotation.
    pub quarantined_until: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_failure_kind: Option<ErrorKind>,
}

impl CredentialHealth {
    fn is_quarantined(&self, now: DateTime<Utc>) -> bool {
        self.quarantined_until.is_some_and(|until| now < until)
    }

    /// Lift an elapsed quarantine. Returns true if one was lifted.
    fn expire(&mut self, now: DateTime<Utc>) -> bool {
        match self.quarantined_until {
            Some(until) if now >= until => {
                self.quarantined_until = None;
                self.consecutive_failures = 0;
                true
            }
            _ => false,
        }
    }
}

struct Entry {
    secret: Secret<String>,
    preview: String,
    health: CredentialHealth,
}

struct PoolState {
    entries: Vec<Entry>,
    cursor: usize,
}

/// A credential handed out for one call.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: CredentialId,
    pub secret: Secret<String>,
    pub preview: String,
    /// True when every credential was quarantined and this one was handed out anyway.
    pub degraded: bool,
}

/// Per-credential line of a status report. Never includes the secret.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub id: CredentialId,
    pub preview: String,
    pub consecutive_failures: u32,
    pub quarantined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_remaining_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_kind: Option<ErrorKind>,
}

/// Pool summary for operational views.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// "healthy" (all available), "degraded" (some) or "unhealthy" (none)
    pub status: &'static str,
    pub total: usize,
    pub available: usize,
    pub quarantined: usize,
    pub cursor: usize,
    pub credentials: Vec<CredentialStatus>,
}

/// Pool of interchangeable credentials with failure-driven quarantine.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
    size: usize,
}

impl CredentialPool {
    /// Create a pool. Every credential starts Available and the cursor at 0.
    pub fn new(credentials: Vec<Secret<String>>, config: PoolConfig) -> Self {
        let entries: Vec<Entry> = credentials
            .into_iter()
            .map(|secret| Entry {
                preview: secret.preview(),
                secret,
                health: CredentialHealth::default(),
            })
            .collect();
        let size = entries.len();
        info!(
            credentials = size,
            cooldown_secs = config.cooldown.num_seconds(),
            failure_threshold = config.failure_threshold,
            fail_open = config.fail_open,
            "credential pool initialized"
        );
        Self {
            state: Mutex::new(PoolState { entries, cursor: 0 }),
            config,
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Select the next available credential round-robin.
    ///
    /// Scans from the cursor, lifting elapsed quarantines on the way, and
    /// leaves the cursor just past the credential returned. When every
    /// credential is quarantined, returns the one at the cursor if the pool
    /// fails open, `None` otherwise. An empty pool always returns `None`.
    pub async fn acquire(&self, now: DateTime<Utc>) -> Option<Lease> {
        let n = self.size;
        if n == 0 {
            warn!("credential pool is empty");
            return None;
        }

        let mut state = self.state.lock().await;
        let start = state.cursor;

        for offset in 0..n {
            let idx = (start + offset) % n;
            let entry = &mut state.entries[idx];
            if entry.health.expire(now) {
                info!(credential = %entry.preview, "quarantine elapsed, credential available again");
            }
            if entry.health.quarantined_until.is_none() {
                let lease = Lease {
                    id: CredentialId(idx),
                    secret: entry.secret.clone(),
                    preview: entry.preview.clone(),
                    degraded: false,
                };
                state.cursor = (idx + 1) % n;
                debug!(credential = %lease.preview, id = %lease.id, "credential acquired");
                return Some(lease);
            }
        }

        if !self.config.fail_open {
            warn!(credentials = n, "all credentials quarantined, refusing selection");
            return None;
        }

        let idx = start;
        let entry = &state.entries[idx];
        warn!(
            credential = %entry.preview,
            credentials = n,
            "all credentials quarantined, reusing one anyway"
        );
        let lease = Lease {
            id: CredentialId(idx),
            secret: entry.secret.clone(),
            preview: entry.preview.clone(),
            degraded: true,
        };
        state.cursor = (idx + 1) % n;
        Some(lease)
    }

    /// A successful call fully rehabilitates the credential.
    pub async fn report_success(&self, id: CredentialId) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(id.0) else {
            warn!(id = %id, "success reported for unknown credential");
            return;
        };
        if entry.health.consecutive_failures > 0 || entry.health.quarantined_until.is_some() {
            info!(
                credential = %entry.preview,
                previous_failures = entry.health.consecutive_failures,
                "credential recovered"
            );
        }
        entry.health.consecutive_failures = 0;
        entry.health.quarantined_until = None;
    }

    /// Record a classified failure and quarantine the credential if warranted.
    ///
    /// Quarantines when the error is quarantine-worthy or the consecutive
    /// failure count reaches the threshold. A failure on a credential that is
    /// already quarantined (handed out fail-open) restarts its cooldown. On
    /// quarantine the cursor moves past the failing credential.
    pub async fn report_failure(&self, id: CredentialId, error: &ClassifiedError, now: DateTime<Utc>) {
        let n = self.size;
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(id.0) else {
            warn!(id = %id, "failure reported for unknown credential");
            return;
        };

        entry.health.expire(now);
        entry.health.consecutive_failures += 1;
        entry.health.last_failure_at = Some(now);
        entry.health.last_failure_kind = Some(error.kind);

        let was_quarantined = entry.health.quarantined_until.is_some();
        let threshold_reached = entry.health.consecutive_failures >= self.config.failure_threshold;
        if !error.quarantine_worthy && !threshold_reached && !was_quarantined {
            debug!(
                credential = %entry.preview,
                kind = error.kind.label(),
                failures = entry.health.consecutive_failures,
                "soft failure recorded"
            );
            return;
        }

        entry.health.quarantined_until = Some(now + self.config.cooldown);
        let reason = if error.quarantine_worthy {
            error.kind.label()
        } else {
            "threshold"
        };

        if was_quarantined {
            info!(credential = %entry.preview, reason, "quarantine extended");
        } else {
            warn!(
                credential = %entry.preview,
                reason,
                failures = entry.health.consecutive_failures,
                cooldown_secs = self.config.cooldown.num_seconds(),
                "credential quarantined"
            );
            metrics::counter!("pool_quarantines_total", "reason" => reason).increment(1);
        }

        state.cursor = (id.0 + 1) % n;
    }

    /// Clear every credential's health. Operator action.
    pub async fn reset_all(&self) {
        let mut state = self.state.lock().await;
        for entry in state.entries.iter_mut() {
            entry.health = CredentialHealth::default();
        }
        info!(credentials = self.size, "credential pool health reset");
    }

    /// Health of one credential, as of the last mutation.
    pub async fn health(&self, id: CredentialId) -> Option<CredentialHealth> {
        let state = self.state.lock().await;
        state.entries.get(id.0).map(|e| e.health.clone())
    }

    /// Counts and redacted per-credential state. Elapsed quarantines count as available.
    pub async fn status(&self, now: DateTime<Utc>) -> PoolStatus {
        let state = self.state.lock().await;

        let credentials: Vec<CredentialStatus> = state
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let quarantined = entry.health.is_quarantined(now);
                let until = entry.health.quarantined_until.filter(|_| quarantined);
                CredentialStatus {
                    id: CredentialId(idx),
                    preview: entry.preview.clone(),
                    consecutive_failures: entry.health.consecutive_failures,
                    quarantined,
                    quarantined_until: until,
                    quarantine_remaining_secs: until.map(|u| (u - now).num_seconds()),
                    last_failure_at: entry.health.last_failure_at,
                    last_failure_kind: entry.health.last_failure_kind,
                }
            })
            .collect();

        let total = credentials.len();
        let quarantined = credentials.iter().filter(|c| c.quarantined).count();
        let available = total - quarantined;
        let status = if total > 0 && available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        PoolStatus {
            status,
            total,
            available,
            quarantined,
            cursor: state.cursor,
            credentials,
        }
    }
}
