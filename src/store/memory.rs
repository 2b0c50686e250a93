//! In-memory store backed by `DashMap`
//!
//! Used by tests and single-process deployments. Each operation holds one
//! shard lock for the duration of a single record update, which gives the
//! same CAS semantics as the PostgreSQL conditional updates.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;

use super::{
    CredentialStore, JobStore, RESUMABLE_STATES, STALLABLE_STATES, SpendOutcome, StatusPatch,
    StoreError, meter_spend,
};
use crate::credential::CredentialRecord;
use crate::job::{JobId, JobState, JobStep, PaymentJob};
use crate::quote::LedgerId;

#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<JobId, PaymentJob>,
    client_refs: DashMap<String, JobId>,
    credentials: DashMap<String, CredentialRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &PaymentJob) -> Result<(), StoreError> {
        if let Some(client_ref) = &job.client_ref {
            match self.client_refs.entry(client_ref.clone()) {
                Entry::Occupied(_) => {
                    return Err(StoreError::Duplicate(format!("client_ref {}", client_ref)));
                }
                Entry::Vacant(slot) => {
                    slot.insert(job.job_id);
                }
            }
        }
        match self.jobs.entry(job.job_id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("job_id {}", job.job_id))),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<PaymentJob>, StoreError> {
        Ok(self.jobs.get(&job_id).map(|j| j.clone()))
    }

    async fn get_by_client_ref(
        &self,
        client_ref: &str,
    ) -> Result<Option<PaymentJob>, StoreError> {
        let Some(job_id) = self.client_refs.get(client_ref).map(|id| *id) else {
            return Ok(None);
        };
        self.get_job(job_id).await
    }

    async fn update_status(
        &self,
        job_id: JobId,
        expected: JobState,
        new: JobState,
        patch: StatusPatch,
    ) -> Result<bool, StoreError> {
        let Some(mut job) = self.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.state != expected {
            return Ok(false);
        }
        job.state = new;
        patch.apply(&mut job);
        job.updated_at = now_ms();
        Ok(true)
    }

    async fn merge_tx_ref(
        &self,
        job_id: JobId,
        step: &JobStep,
        tx_ref: &str,
    ) -> Result<bool, StoreError> {
        let Some(mut job) = self.jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound(job_id.to_string()));
        };
        let key = step.key();
        if job.tx_refs.contains_key(&key) {
            return Ok(false);
        }
        job.tx_refs.insert(key, tx_ref.to_string());
        job.updated_at = now_ms();
        Ok(true)
    }

    async fn record_conversion(
        &self,
        job_id: JobId,
        ledger: &LedgerId,
        tx_ref: &str,
        actual_output: Decimal,
    ) -> Result<bool, StoreError> {
        let Some(mut job) = self.jobs.get_mut(&job_id) else {
            return Err(StoreError::NotFound(job_id.to_string()));
        };
        let key = JobStep::Convert(ledger.clone()).key();
        if job.tx_refs.contains_key(&key) {
            return Ok(false);
        }
        let Some(quote) = job.quote.as_mut() else {
            return Err(StoreError::NotFound(format!("plan of job {}", job_id)));
        };
        let mut found = false;
        for step in quote
            .plan
            .iter_mut()
            .filter(|s| s.is_conversion() && &s.ledger == ledger)
        {
            step.converted_amount = Some(actual_output);
            found = true;
        }
        if !found {
            return Err(StoreError::NotFound(format!(
                "conversion step on {} in job {}",
                ledger, job_id
            )));
        }
        job.tx_refs.insert(key, tx_ref.to_string());
        job.updated_at = now_ms();
        Ok(true)
    }

    async fn find_expired(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError> {
        let mut jobs: Vec<PaymentJob> = self
            .jobs
            .iter()
            .filter(|j| {
                j.state == JobState::AwaitingConfirmation && j.confirmation_elapsed(now_ms)
            })
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.expires_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn find_stalled(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError> {
        let mut jobs: Vec<PaymentJob> = self
            .jobs
            .iter()
            .filter(|j| STALLABLE_STATES.contains(&j.state) && j.updated_at < cutoff_ms)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.updated_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn find_in_flight(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError> {
        let mut jobs: Vec<PaymentJob> = self
            .jobs
            .iter()
            .filter(|j| RESUMABLE_STATES.contains(&j.state) && j.updated_at < cutoff_ms)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.updated_at);
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get_credential(&self, payer: &str) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self.credentials.get(payer).map(|r| r.clone()))
    }

    async fn upsert_credential(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        match self.credentials.entry(record.payer.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().version >= record.version {
                    return Err(StoreError::Duplicate(format!(
                        "credential {} version {}",
                        record.payer, record.version
                    )));
                }
                existing.insert(record.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }
        Ok(())
    }

    async fn set_custody_ref(
        &self,
        payer: &str,
        version: i32,
        custody_ref: &str,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.credentials.get_mut(payer) else {
            return Ok(false);
        };
        if record.version != version || record.custody_ref.is_some() {
            return Ok(false);
        }
        record.custody_ref = Some(custody_ref.to_string());
        record.updated_at = now_ms();
        Ok(true)
    }

    async fn record_spend(
        &self,
        payer: &str,
        spend_key: &str,
        amount: Decimal,
    ) -> Result<SpendOutcome, StoreError> {
        let Some(mut record) = self.credentials.get_mut(payer) else {
            return Err(StoreError::NotFound(format!("credential {}", payer)));
        };
        let outcome = meter_spend(&record.spends, record.scope.spend_limit, spend_key, amount);
        if outcome != SpendOutcome::Recorded {
            return Ok(outcome);
        }
        record.spends.insert(spend_key.to_string(), amount);
        record.updated_at = now_ms();
        Ok(SpendOutcome::Recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRequest, SettlementMode};
    use crate::quote::{FeeBreakdown, Quote, SourceStep};
    use rust_decimal_macros::dec;

    fn job(client_ref: Option<&str>) -> PaymentJob {
        let mut req = JobRequest::new("0xpayer", dec!(50), SettlementMode::direct("0xm"));
        req.client_ref = client_ref.map(str::to_string);
        PaymentJob::new(JobId::new(), req, "0xf".into())
    }

    fn quote_with_conversion() -> Quote {
        Quote {
            target_amount: dec!(50),
            fees: FeeBreakdown::default(),
            payer_total: dec!(50),
            recipient_amount: dec!(50),
            settlement_gross: dec!(50),
            plan: vec![
                SourceStep::direct(LedgerId::from("base"), dec!(30), true),
                SourceStep::convert(LedgerId::from("alt"), dec!(20), dec!(0.02), false),
            ],
            trivial: false,
        }
    }

    #[tokio::test]
    async fn test_cas_update() {
        let store = MemoryStore::new();
        let j = job(None);
        store.create_job(&j).await.unwrap();

        assert!(
            store
                .update_status(j.job_id, JobState::Scanning, JobState::Routing, StatusPatch::new())
                .await
                .unwrap()
        );
        // stale expected state loses
        assert!(
            !store
                .update_status(j.job_id, JobState::Scanning, JobState::Failed, StatusPatch::new())
                .await
                .unwrap()
        );
        let stored = store.get_job(j.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Routing);
    }

    #[tokio::test]
    async fn test_duplicate_client_ref_rejected() {
        let store = MemoryStore::new();
        store.create_job(&job(Some("order-7"))).await.unwrap();
        assert!(matches!(
            store.create_job(&job(Some("order-7"))).await,
            Err(StoreError::Duplicate(_))
        ));
        assert!(store.get_by_client_ref("order-7").await.unwrap().is_some());
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn test_merge_tx_ref_never_overwrites() {
        let store = MemoryStore::new();
        let j = job(None);
        store.create_job(&j).await.unwrap();

        assert!(store.merge_tx_ref(j.job_id, &JobStep::Settle, "0x1").await.unwrap());
        assert!(!store.merge_tx_ref(j.job_id, &JobStep::Settle, "0x2").await.unwrap());
        let stored = store.get_job(j.job_id).await.unwrap().unwrap();
        assert_eq!(stored.tx_ref(&JobStep::Settle), Some("0x1"));
    }

    #[tokio::test]
    async fn test_record_conversion_sets_amount_and_ref() {
        let store = MemoryStore::new();
        let mut j = job(None);
        j.quote = Some(quote_with_conversion());
        store.create_job(&j).await.unwrap();

        let alt = LedgerId::from("alt");
        assert!(
            store
                .record_conversion(j.job_id, &alt, "0xswap", dec!(20.4))
                .await
                .unwrap()
        );
        assert!(
            !store
                .record_conversion(j.job_id, &alt, "0xswap2", dec!(1))
                .await
                .unwrap()
        );

        let stored = store.get_job(j.job_id).await.unwrap().unwrap();
        assert_eq!(stored.plan()[1].converted_amount, Some(dec!(20.4)));
        assert_eq!(stored.plan()[1].available(), dec!(20.4));
        assert_eq!(stored.tx_ref(&JobStep::Convert(alt)), Some("0xswap"));
    }

    #[tokio::test]
    async fn test_find_expired_and_stalled() {
        let store = MemoryStore::new();
        let mut waiting = job(None);
        waiting.state = JobState::AwaitingConfirmation;
        waiting.expires_at = Some(1_000);
        store.create_job(&waiting).await.unwrap();

        let mut bridging = job(None);
        bridging.state = JobState::Bridging;
        bridging.updated_at = 500;
        store.create_job(&bridging).await.unwrap();

        let mut settling = job(None);
        settling.state = JobState::Settling;
        settling.updated_at = 500;
        store.create_job(&settling).await.unwrap();

        assert!(store.find_expired(999, 10).await.unwrap().is_empty());
        // the deadline itself counts as elapsed, as in confirm
        assert_eq!(store.find_expired(1_000, 10).await.unwrap().len(), 1);
        assert_eq!(store.find_expired(1_001, 10).await.unwrap().len(), 1);

        let stalled = store.find_stalled(600, 10).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].job_id, bridging.job_id);

        let in_flight = store.find_in_flight(600, 10).await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].job_id, settling.job_id);
        assert!(store.find_in_flight(400, 10).await.unwrap().is_empty());
    }
}
