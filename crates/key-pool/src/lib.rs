//! Credential pool and request admission for a metered generation API
//!
//! Rotates a fixed set of API keys round-robin, quarantines keys that hit
//! quota or are rejected, and gates every request through a per-day local
//! quota with minimum spacing. The orchestrator ties these together and turns
//! upstream failures into user-safe guidance.
//!
//! Request lifecycle:
//! 1. `QuotaLedger::try_admit` consumes one unit or refuses (daily cap, spacing)
//! 2. `CredentialPool::acquire` picks the next healthy key
//! 3. The provider is called; failures go through `classify`
//! 4. The outcome is reported back to the pool (success resets, hard failure quarantines)
//! 5. Transient failures are retried on another key after a bounded wait

pub mod classify;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod pool;
pub mod store;

pub use classify::{ClassifiedError, ErrorKind, classify};
pub use error::{Error, Result};
pub use ledger::{Admission, QuotaConfig, QuotaLedger, QuotaRecord, QuotaSnapshot};
pub use orchestrator::{FailureKind, InvokeFailure, InvokeOutcome, Orchestrator, RetryPolicy};
pub use pool::{CredentialId, CredentialPool, Lease, PoolConfig, PoolStatus};
pub use store::{FileStore, KeyValueStore, MemoryStore};
