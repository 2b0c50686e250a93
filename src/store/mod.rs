//! Persistence boundary
//!
//! The orchestrator never issues raw queries. Every mutation goes through one
//! of the narrow operations below; job status changes are compare-and-set on
//! the expected current state, which is the only serialization point between
//! concurrent callers.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::credential::CredentialRecord;
use crate::job::{JobId, JobState, JobStep, PaymentJob};
use crate::quote::{LedgerId, Quote};

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Partial field update applied together with a status CAS.
///
/// Unset fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub error: Option<String>,
    pub clear_error: bool,
    pub quote: Option<Quote>,
    /// Discard quote, plan and shortfall (retry from scratch)
    pub reset_plan: bool,
    pub shortfall: Option<Decimal>,
    pub expires_at: Option<i64>,
    pub increment_retry: bool,
}

impl StatusPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn quote(mut self, quote: Quote) -> Self {
        self.quote = Some(quote);
        self
    }

    pub fn shortfall(mut self, shortfall: Decimal) -> Self {
        self.shortfall = Some(shortfall);
        self
    }

    pub fn expires_at(mut self, at_ms: i64) -> Self {
        self.expires_at = Some(at_ms);
        self
    }

    /// Patch for the FAILED -> resume transition
    pub fn retry(reset_plan: bool) -> Self {
        Self {
            clear_error: true,
            reset_plan,
            increment_retry: true,
            ..Self::default()
        }
    }

    /// Apply the patch to an in-memory record.
    pub(crate) fn apply(self, job: &mut PaymentJob) {
        if self.clear_error {
            job.error = None;
        }
        if let Some(error) = self.error {
            job.error = Some(error);
        }
        if self.reset_plan {
            job.quote = None;
            job.shortfall = None;
        }
        if let Some(quote) = self.quote {
            job.quote = Some(quote);
        }
        if let Some(shortfall) = self.shortfall {
            job.shortfall = Some(shortfall);
        }
        if let Some(at) = self.expires_at {
            job.expires_at = Some(at);
        }
        if self.increment_retry {
            job.retry_count += 1;
        }
    }
}

/// Outcome of [`CredentialStore::record_spend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendOutcome {
    /// New key, or a known key raised to a larger amount
    Recorded,
    /// The key is already metered at this amount or more; nothing changed
    AlreadyRecorded,
    LimitExceeded,
}

/// Meter `amount` under `spend_key` against `limit`.
///
/// A known key is held at the larger of its recorded and requested amounts,
/// so only the increase counts against the limit.
pub(crate) fn meter_spend(
    spends: &BTreeMap<String, Decimal>,
    limit: Decimal,
    spend_key: &str,
    amount: Decimal,
) -> SpendOutcome {
    let previous = spends.get(spend_key).copied();
    if previous.is_some_and(|p| amount <= p) {
        return SpendOutcome::AlreadyRecorded;
    }
    let spent: Decimal = spends.values().copied().sum();
    if spent - previous.unwrap_or_default() + amount > limit {
        SpendOutcome::LimitExceeded
    } else {
        SpendOutcome::Recorded
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with [`StoreError::Duplicate`] if the id or
    /// client reference is taken.
    async fn create_job(&self, job: &PaymentJob) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<PaymentJob>, StoreError>;

    async fn get_by_client_ref(&self, client_ref: &str)
    -> Result<Option<PaymentJob>, StoreError>;

    /// CAS: move `expected -> new` and apply `patch` in the same write.
    ///
    /// Returns false if the stored state is not `expected`.
    async fn update_status(
        &self,
        job_id: JobId,
        expected: JobState,
        new: JobState,
        patch: StatusPatch,
    ) -> Result<bool, StoreError>;

    /// Record a step reference. Never overwrites: returns false if the step
    /// already has one.
    async fn merge_tx_ref(
        &self,
        job_id: JobId,
        step: &JobStep,
        tx_ref: &str,
    ) -> Result<bool, StoreError>;

    /// Record a conversion reference and its actual output on the plan step,
    /// atomically. Returns false if the conversion was already recorded.
    async fn record_conversion(
        &self,
        job_id: JobId,
        ledger: &LedgerId,
        tx_ref: &str,
        actual_output: Decimal,
    ) -> Result<bool, StoreError>;

    /// Jobs awaiting confirmation whose deadline is at or before `now_ms`
    async fn find_expired(&self, now_ms: i64, limit: usize)
    -> Result<Vec<PaymentJob>, StoreError>;

    /// Jobs in CONVERTING or BRIDGING not updated since `cutoff_ms`
    async fn find_stalled(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError>;

    /// Jobs in SCANNING, ROUTING or SETTLING not updated since `cutoff_ms`
    async fn find_in_flight(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, payer: &str) -> Result<Option<CredentialRecord>, StoreError>;

    /// Insert or supersede the payer's record
    async fn upsert_credential(&self, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Cache a custody reference on the given record version, only if none
    /// is set yet. Returns false otherwise.
    async fn set_custody_ref(
        &self,
        payer: &str,
        version: i32,
        custody_ref: &str,
    ) -> Result<bool, StoreError>;

    /// Meter `amount` under `spend_key` (see [`meter_spend`]) unless the
    /// total would exceed the record's spend limit.
    async fn record_spend(
        &self,
        payer: &str,
        spend_key: &str,
        amount: Decimal,
    ) -> Result<SpendOutcome, StoreError>;
}

/// Jobs whose stored state counts as stalled when left untouched
pub(crate) const STALLABLE_STATES: [JobState; 2] = [JobState::Converting, JobState::Bridging];

/// Executing states a sweep may re-drive from the top of the step
pub(crate) const RESUMABLE_STATES: [JobState; 3] =
    [JobState::Scanning, JobState::Routing, JobState::Settling];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRequest, SettlementMode};
    use rust_decimal_macros::dec;

    fn job() -> PaymentJob {
        let req = JobRequest::new("0xpayer", dec!(10), SettlementMode::direct("0xm"));
        PaymentJob::new(JobId::new(), req, "0xf".into())
    }

    #[test]
    fn test_patch_retry_clears_error_and_plan() {
        let mut job = job();
        job.error = Some("boom".into());
        job.shortfall = Some(dec!(3));
        StatusPatch::retry(true).apply(&mut job);
        assert!(job.error.is_none());
        assert!(job.shortfall.is_none());
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn test_meter_spend_counts_only_increase() {
        let mut spends = BTreeMap::new();
        spends.insert("job-1".to_string(), dec!(40));
        spends.insert("job-2".to_string(), dec!(5));

        // same or smaller amount under a known key is already covered
        assert_eq!(meter_spend(&spends, dec!(50), "job-1", dec!(40)), SpendOutcome::AlreadyRecorded);
        assert_eq!(meter_spend(&spends, dec!(50), "job-1", dec!(10)), SpendOutcome::AlreadyRecorded);
        // raising job-1 to 45 brings the total to exactly the limit
        assert_eq!(meter_spend(&spends, dec!(50), "job-1", dec!(45)), SpendOutcome::Recorded);
        assert_eq!(meter_spend(&spends, dec!(50), "job-1", dec!(90)), SpendOutcome::LimitExceeded);
        assert_eq!(meter_spend(&spends, dec!(50), "job-3", dec!(6)), SpendOutcome::LimitExceeded);
        assert_eq!(meter_spend(&spends, dec!(50), "job-3", dec!(5)), SpendOutcome::Recorded);
    }

    #[test]
    fn test_patch_keeps_unset_fields() {
        let mut job = job();
        job.expires_at = Some(42);
        StatusPatch::new().error("x").apply(&mut job);
        assert_eq!(job.expires_at, Some(42));
        assert_eq!(job.error.as_deref(), Some("x"));
    }
}
