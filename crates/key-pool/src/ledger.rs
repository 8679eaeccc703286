//! Client-side request budget
//!
//! Two gates guard every admitted request: a daily cap and a minimum spacing
//! between admissions. Days are UTC calendar days; a record is keyed
//! `quota_<YYYY-MM-DD>` and a record for any other day is ignored, so rollover
//! happens lazily the first time the ledger is consulted on a new day.
//!
//! The current day's record is cached in memory and written through to the
//! `KeyValueStore` after each admission. Store failures are logged and never
//! block admission decisions: the in-memory record stays authoritative for the
//! life of the process.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "quota_";

/// Per-day usage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub date: NaiveDate,
    pub used: u32,
    pub limit: u32,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl QuotaRecord {
    fn fresh(date: NaiveDate, limit: u32) -> Self {
        Self {
            date,
            used: 0,
            limit,
            last_request_at: None,
        }
    }
}

/// Ledger limits.
#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    pub daily_limit: u32,
    /// Zero disables the spacing gate.
    pub min_interval: TimeDelta,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 5,
            min_interval: TimeDelta::minutes(2),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Today's allowance is spent; resets at the next UTC midnight.
    DailyLimitReached { resets_at: DateTime<Utc> },
    /// The previous admission was too recent.
    TooSoon { next_eligible_at: DateTime<Utc> },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    fn reason(&self) -> &'static str {
        match self {
            Admission::Admitted => "admitted",
            Admission::DailyLimitReached { .. } => "daily_limit",
            Admission::TooSoon { .. } => "min_interval",
        }
    }
}

/// Read-only view for display (remaining allowance, countdowns).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub date: NaiveDate,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub resets_at: DateTime<Utc>,
}

/// Daily quota plus minimum-spacing gate.
pub struct QuotaLedger {
    store: Arc<dyn KeyValueStore>,
    config: QuotaConfig,
    current: Mutex<Option<QuotaRecord>>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn KeyValueStore>, config: QuotaConfig) -> Self {
        info!(
            daily_limit = config.daily_limit,
            min_interval_secs = config.min_interval.num_seconds(),
            "quota ledger initialized"
        );
        Self {
            store,
            config,
            current: Mutex::new(None),
        }
    }

    /// Admit a request at `now`, consuming one unit of today's allowance.
    pub async fn admit(&self, now: DateTime<Utc>) -> bool {
        self.try_admit(now).await.is_admitted()
    }

    /// Admit a request at `now`, reporting why it was refused.
    ///
    /// On `Admitted`, `used` is incremented and `last_request_at` set to `now`
    /// under the ledger lock; otherwise nothing changes.
    pub async fn try_admit(&self, now: DateTime<Utc>) -> Admission {
        let mut slot = self.current.lock().await;
        let mut record = self.current_record(&mut slot, now.date_naive()).await;

        let admission = self.evaluate(&record, now);
        if !admission.is_admitted() {
            info!(
                reason = admission.reason(),
                used = record.used,
                limit = record.limit,
                "request refused by quota ledger"
            );
            metrics::counter!("quota_rejections_total", "reason" => admission.reason())
                .increment(1);
            return admission;
        }

        record.used += 1;
        record.last_request_at = Some(now);
        *slot = Some(record);
        debug!(used = record.used, limit = record.limit, "request admitted");
        self.persist(&record).await;
        admission
    }

    /// Non-mutating preview of what `try_admit` would decide at `now`.
    pub async fn check(&self, now: DateTime<Utc>) -> Admission {
        let mut slot = self.current.lock().await;
        let record = self.current_record(&mut slot, now.date_naive()).await;
        self.evaluate(&record, now)
    }

    /// Units left today: `max(0, limit - used)`.
    pub async fn remaining(&self, now: DateTime<Utc>) -> u32 {
        let mut slot = self.current.lock().await;
        let record = self.current_record(&mut slot, now.date_naive()).await;
        record.limit.saturating_sub(record.used)
    }

    /// When the spacing gate next opens, if it is currently closed.
    pub async fn next_eligible_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut slot = self.current.lock().await;
        let record = self.current_record(&mut slot, now.date_naive()).await;
        self.next_eligible(&record, now)
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> QuotaSnapshot {
        let mut slot = self.current.lock().await;
        let record = self.current_record(&mut slot, now.date_naive()).await;
        QuotaSnapshot {
            date: record.date,
            used: record.used,
            limit: record.limit,
            remaining: record.limit.saturating_sub(record.used),
            next_eligible_at: self.next_eligible(&record, now),
            resets_at: next_reset(now),
        }
    }

    /// Delete stored records for days other than today. Returns how many were removed.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let today = record_key(now.date_naive());
        let mut removed = 0;
        for key in self.store.keys().await? {
            if key.starts_with(KEY_PREFIX) && key != today {
                self.store.remove(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "removed expired quota records");
        }
        Ok(removed)
    }

    fn evaluate(&self, record: &QuotaRecord, now: DateTime<Utc>) -> Admission {
        if record.used >= record.limit {
            return Admission::DailyLimitReached {
                resets_at: next_reset(now),
            };
        }
        match record.last_request_at {
            Some(last) if (now - last).max(TimeDelta::zero()) < self.config.min_interval => {
                Admission::TooSoon {
                    next_eligible_at: last + self.config.min_interval,
                }
            }
            _ => Admission::Admitted,
        }
    }

    fn next_eligible(&self, record: &QuotaRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        record
            .last_request_at
            .map(|last| last + self.config.min_interval)
            .filter(|at| *at > now)
    }

    /// Today's record, loading or synthesizing it when the cache is for another day.
    async fn current_record(&self, slot: &mut Option<QuotaRecord>, today: NaiveDate) -> QuotaRecord {
        let cached = *slot;
        match cached {
            Some(record) if record.date == today => record,
            _ => {
                let record = self.load(today).await;
                *slot = Some(record);
                record
            }
        }
    }

    async fn load(&self, today: NaiveDate) -> QuotaRecord {
        let fresh = QuotaRecord::fresh(today, self.config.daily_limit);
        let key = record_key(today);
        match self.store.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<QuotaRecord>(&bytes) {
                Ok(record) if record.date == today => record,
                Ok(record) => {
                    warn!(key = %key, stored_date = %record.date, "quota record date mismatch, starting fresh");
                    fresh
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "unreadable quota record, starting fresh");
                    fresh
                }
            },
            Ok(None) => fresh,
            Err(e) => {
                warn!(key = %key, error = %e, "quota store read failed, starting fresh");
                fresh
            }
        }
    }

    async fn persist(&self, record: &QuotaRecord) {
        let key = record_key(record.date);
        let bytes = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to encode quota record");
                return;
            }
        };
        if let Err(e) = self.store.set(&key, bytes).await {
            warn!(key = %key, error = %e, "failed to persist quota record");
        }
    }
}

fn record_key(date: NaiveDate) -> String {
    format!("{KEY_PREFIX}{}", date.format("%Y-%m-%d"))
}

/// Start of the next UTC day.
fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(NaiveDate::MAX);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}
