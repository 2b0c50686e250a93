//! PostgreSQL store
//!
//! Plan, quote, settlement target and tx refs are JSONB columns. Status
//! changes are conditional updates on the expected state; multi-field
//! read-modify-write operations run in a transaction holding the row lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{
    CredentialStore, JobStore, RESUMABLE_STATES, STALLABLE_STATES, SpendOutcome, StatusPatch,
    StoreError, meter_spend,
};
use crate::credential::{CredentialRecord, CredentialScope};
use crate::job::{JobId, JobState, JobStep, PaymentJob, SettlementMode, TxRefs};
use crate::quote::{LedgerId, Quote};

const SCHEMA: &str = include_str!("../../migrations/001_payment_jobs.sql");

const JOB_COLUMNS: &str = r#"
    job_id, client_ref, payer, funding_address, settlement, target_amount,
    auto_execute, state, quote, tx_refs, error_message, shortfall,
    retry_count, created_at, updated_at, expires_at
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Create tables and indexes if missing
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn to_timestamp(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {}", ms)))
}

fn row_to_job(row: &PgRow) -> Result<PaymentJob, StoreError> {
    let job_id_str: String = row.try_get("job_id")?;
    let job_id: JobId = job_id_str
        .parse()
        .map_err(|_| StoreError::Serialization(format!("invalid job_id: {}", job_id_str)))?;

    let state_id: i16 = row.try_get("state")?;
    let state = JobState::from_id(state_id)
        .ok_or_else(|| StoreError::Serialization(format!("invalid state id: {}", state_id)))?;

    let settlement: Json<SettlementMode> = row.try_get("settlement")?;
    let quote: Option<Json<Quote>> = row.try_get("quote")?;
    let tx_refs: Json<TxRefs> = row.try_get("tx_refs")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at")?;

    Ok(PaymentJob {
        job_id,
        client_ref: row.try_get("client_ref")?,
        payer: row.try_get("payer")?,
        funding_address: row.try_get("funding_address")?,
        settlement: settlement.0,
        target_amount: row.try_get("target_amount")?,
        auto_execute: row.try_get("auto_execute")?,
        state,
        quote: quote.map(|q| q.0),
        tx_refs: tx_refs.0,
        error: row.try_get("error_message")?,
        shortfall: row.try_get("shortfall")?,
        retry_count: row.try_get("retry_count")?,
        created_at: created_at.timestamp_millis(),
        updated_at: updated_at.timestamp_millis(),
        expires_at: expires_at.map(|t| t.timestamp_millis()),
    })
}

fn row_to_credential(row: &PgRow) -> Result<CredentialRecord, StoreError> {
    let scope: Json<CredentialScope> = row.try_get("scope")?;
    let spends: Json<BTreeMap<String, Decimal>> = row.try_get("spends")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(CredentialRecord {
        payer: row.try_get("payer")?,
        address: row.try_get("address")?,
        ciphertext: row.try_get("ciphertext")?,
        nonce: row.try_get("nonce")?,
        scope: scope.0,
        custody_ref: row.try_get("custody_ref")?,
        version: row.try_get("version")?,
        spends: spends.0,
        created_at: created_at.timestamp_millis(),
        updated_at: updated_at.timestamp_millis(),
    })
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, job: &PaymentJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payment_jobs
                (job_id, client_ref, payer, funding_address, settlement, target_amount,
                 auto_execute, state, quote, tx_refs, error_message, shortfall,
                 retry_count, created_at, updated_at, expires_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), $15)
            "#,
        )
        .bind(job.job_id.to_string())
        .bind(&job.client_ref)
        .bind(&job.payer)
        .bind(&job.funding_address)
        .bind(Json(&job.settlement))
        .bind(job.target_amount)
        .bind(job.auto_execute)
        .bind(job.state.id())
        .bind(job.quote.as_ref().map(Json))
        .bind(Json(&job.tx_refs))
        .bind(&job.error)
        .bind(job.shortfall)
        .bind(job.retry_count)
        .bind(to_timestamp(job.created_at)?)
        .bind(job.expires_at.map(to_timestamp).transpose()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<PaymentJob>, StoreError> {
        let sql = format!("SELECT {} FROM payment_jobs WHERE job_id = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn get_by_client_ref(
        &self,
        client_ref: &str,
    ) -> Result<Option<PaymentJob>, StoreError> {
        let sql = format!("SELECT {} FROM payment_jobs WHERE client_ref = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(client_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn update_status(
        &self,
        job_id: JobId,
        expected: JobState,
        new: JobState,
        patch: StatusPatch,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_jobs SET
                state = $1,
                error_message = COALESCE($5, CASE WHEN $4 THEN NULL ELSE error_message END),
                quote = COALESCE($7, CASE WHEN $6 THEN NULL ELSE quote END),
                shortfall = COALESCE($8, CASE WHEN $6 THEN NULL ELSE shortfall END),
                expires_at = COALESCE($9, expires_at),
                retry_count = retry_count + $10,
                updated_at = NOW()
            WHERE job_id = $2 AND state = $3
            "#,
        )
        .bind(new.id())
        .bind(job_id.to_string())
        .bind(expected.id())
        .bind(patch.clear_error)
        .bind(patch.error)
        .bind(patch.reset_plan)
        .bind(patch.quote.map(Json))
        .bind(patch.shortfall)
        .bind(patch.expires_at.map(to_timestamp).transpose()?)
        .bind(if patch.increment_retry { 1i32 } else { 0i32 })
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn merge_tx_ref(
        &self,
        job_id: JobId,
        step: &JobStep,
        tx_ref: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_jobs
            SET tx_refs = tx_refs || jsonb_build_object($2::text, $3::text),
                updated_at = NOW()
            WHERE job_id = $1 AND NOT (tx_refs ? $2)
            "#,
        )
        .bind(job_id.to_string())
        .bind(step.key())
        .bind(tx_ref)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_conversion(
        &self,
        job_id: JobId,
        ledger: &LedgerId,
        tx_ref: &str,
        actual_output: Decimal,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT quote, tx_refs FROM payment_jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let mut tx_refs: Json<TxRefs> = row.try_get("tx_refs")?;
        let key = JobStep::Convert(ledger.clone()).key();
        if tx_refs.0.contains_key(&key) {
            return Ok(false);
        }

        let quote: Option<Json<Quote>> = row.try_get("quote")?;
        let mut quote = quote
            .map(|q| q.0)
            .ok_or_else(|| StoreError::NotFound(format!("plan of job {}", job_id)))?;

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
        tx_refs.0.insert(key, tx_ref.to_string());

        sqlx::query(
            "UPDATE payment_jobs SET quote = $2, tx_refs = $3, updated_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id.to_string())
        .bind(Json(&quote))
        .bind(Json(&tx_refs.0))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn find_expired(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM payment_jobs
            WHERE state = $1 AND expires_at <= $2
            ORDER BY expires_at ASC
            LIMIT $3
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(JobState::AwaitingConfirmation.id())
            .bind(to_timestamp(now_ms)?)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn find_stalled(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError> {
        self.find_untouched(&STALLABLE_STATES, cutoff_ms, limit).await
    }

    async fn find_in_flight(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError> {
        self.find_untouched(&RESUMABLE_STATES, cutoff_ms, limit).await
    }
}

impl PgStore {
    /// Jobs in any of `states` whose last update is before `cutoff_ms`
    async fn find_untouched(
        &self,
        states: &[JobState],
        cutoff_ms: i64,
        limit: usize,
    ) -> Result<Vec<PaymentJob>, StoreError> {
        let states: Vec<i16> = states.iter().map(|s| s.id()).collect();
        let sql = format!(
            r#"
            SELECT {} FROM payment_jobs
            WHERE state = ANY($1) AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(states)
            .bind(to_timestamp(cutoff_ms)?)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn get_credential(&self, payer: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT payer, address, ciphertext, nonce, scope, custody_ref, version,
                   spends, created_at, updated_at
            FROM credential_records
            WHERE payer = $1
            "#,
        )
        .bind(payer)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_credential).transpose()
    }

    async fn upsert_credential(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO credential_records
                (payer, address, ciphertext, nonce, scope, custody_ref, version, spends,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (payer) DO UPDATE SET
                address = EXCLUDED.address,
                ciphertext = EXCLUDED.ciphertext,
                nonce = EXCLUDED.nonce,
                scope = EXCLUDED.scope,
                custody_ref = EXCLUDED.custody_ref,
                version = EXCLUDED.version,
                spends = EXCLUDED.spends,
                created_at = EXCLUDED.created_at,
                updated_at = NOW()
            WHERE credential_records.version < EXCLUDED.version
            "#,
        )
        .bind(&record.payer)
        .bind(&record.address)
        .bind(&record.ciphertext)
        .bind(&record.nonce)
        .bind(Json(&record.scope))
        .bind(&record.custody_ref)
        .bind(record.version)
        .bind(Json(&record.spends))
        .bind(to_timestamp(record.created_at)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!(
                "credential {} version {}",
                record.payer, record.version
            )));
        }
        Ok(())
    }

    async fn set_custody_ref(
        &self,
        payer: &str,
        version: i32,
        custody_ref: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE credential_records
            SET custody_ref = $3, updated_at = NOW()
            WHERE payer = $1 AND version = $2 AND custody_ref IS NULL
            "#,
        )
        .bind(payer)
        .bind(version)
        .bind(custody_ref)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_spend(
        &self,
        payer: &str,
        spend_key: &str,
        amount: Decimal,
    ) -> Result<SpendOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT scope, spends FROM credential_records WHERE payer = $1 FOR UPDATE")
            .bind(payer)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("credential {}", payer)))?;

        let scope: Json<CredentialScope> = row.try_get("scope")?;
        let mut spends: Json<BTreeMap<String, Decimal>> = row.try_get("spends")?;

        let outcome = meter_spend(&spends.0, scope.0.spend_limit, spend_key, amount);
        if outcome != SpendOutcome::Recorded {
            return Ok(outcome);
        }
        spends.0.insert(spend_key.to_string(), amount);

        sqlx::query("UPDATE credential_records SET spends = $2, updated_at = NOW() WHERE payer = $1")
            .bind(payer)
            .bind(Json(&spends.0))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(SpendOutcome::Recorded)
    }
}
