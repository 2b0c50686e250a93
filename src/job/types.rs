//! Payment Job Types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::state::JobState;
use crate::quote::{LedgerId, Quote, SourceStep};

/// Job ID - ULID-based, sortable, no coordination needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(ulid::Ulid);

impl JobId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// How the recipient side is paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SettlementMode {
    Direct {
        recipient: String,
    },
    /// Weights are basis points summing to 10000. The recipient-configuration
    /// owner enforces that; it is not re-checked here.
    Split {
        recipients: Vec<String>,
        weights_bps: Vec<u32>,
    },
}

impl SettlementMode {
    pub fn direct(recipient: impl Into<String>) -> Self {
        SettlementMode::Direct {
            recipient: recipient.into(),
        }
    }
}

/// Side-effecting step that records a transaction reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobStep {
    Convert(LedgerId),
    Bridge(LedgerId),
    Settle,
}

impl JobStep {
    /// Key under which the reference is stored
    pub fn key(&self) -> String {
        match self {
            JobStep::Convert(ledger) => format!("convert:{}", ledger),
            JobStep::Bridge(ledger) => format!("bridge:{}", ledger),
            JobStep::Settle => "settle".to_string(),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key.split_once(':') {
            Some(("convert", ledger)) => Some(JobStep::Convert(LedgerId::from(ledger))),
            Some(("bridge", ledger)) => Some(JobStep::Bridge(LedgerId::from(ledger))),
            None if key == "settle" => Some(JobStep::Settle),
            _ => None,
        }
    }
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Recorded transaction references, keyed by [`JobStep::key`]
pub type TxRefs = BTreeMap<String, String>;

/// Job creation request from the API layer
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Payer address; also the credential key
    pub payer: String,
    pub target_amount: Decimal,
    pub settlement: SettlementMode,
    /// Skip the confirmation gate (recurring charges)
    pub auto_execute: bool,
    /// Client-provided idempotency key
    pub client_ref: Option<String>,
}

impl JobRequest {
    pub fn new(payer: impl Into<String>, target_amount: Decimal, settlement: SettlementMode) -> Self {
        Self {
            payer: payer.into(),
            target_amount,
            settlement,
            auto_execute: false,
            client_ref: None,
        }
    }

    pub fn auto_execute(mut self) -> Self {
        self.auto_execute = true;
        self
    }

    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }
}

/// Persisted payment job
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentJob {
    pub job_id: JobId,
    pub client_ref: Option<String>,
    pub payer: String,
    /// Address of the payer's ephemeral credential, where funds are gathered
    pub funding_address: String,
    pub settlement: SettlementMode,
    pub target_amount: Decimal,
    pub auto_execute: bool,
    pub state: JobState,
    /// Quote including the sourcing plan; set when ROUTING succeeds
    pub quote: Option<Quote>,
    pub tx_refs: TxRefs,
    pub error: Option<String>,
    /// Missing amount of an infeasible plan
    pub shortfall: Option<Decimal>,
    pub retry_count: i32,
    /// Created timestamp (millis)
    pub created_at: i64,
    /// Last updated timestamp (millis)
    pub updated_at: i64,
    /// Confirmation deadline (millis)
    pub expires_at: Option<i64>,
}

impl PaymentJob {
    pub fn new(job_id: JobId, req: JobRequest, funding_address: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            job_id,
            client_ref: req.client_ref,
            payer: req.payer,
            funding_address,
            settlement: req.settlement,
            target_amount: req.target_amount,
            auto_execute: req.auto_execute,
            state: JobState::Scanning,
            quote: None,
            tx_refs: TxRefs::new(),
            error: None,
            shortfall: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn plan(&self) -> &[SourceStep] {
        self.quote.as_ref().map(|q| q.plan.as_slice()).unwrap_or(&[])
    }

    pub fn tx_ref(&self, step: &JobStep) -> Option<&str> {
        self.tx_refs.get(&step.key()).map(String::as_str)
    }

    pub fn has_tx_ref(&self, step: &JobStep) -> bool {
        self.tx_refs.contains_key(&step.key())
    }

    /// The confirmation deadline is reached at `expires_at` itself
    pub fn confirmation_elapsed(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView::from(self)
    }
}

impl fmt::Display for PaymentJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Job[{}] payer={} target={} state={}",
            self.job_id, self.payer, self.target_amount, self.state
        )
    }
}

/// Job status surface for callers outside the core
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub state: &'static str,
    pub target_amount: Decimal,
    pub quote: Option<Quote>,
    pub tx_refs: TxRefs,
    pub error: Option<String>,
    pub shortfall: Option<Decimal>,
    pub retry_count: i32,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
}

impl From<&PaymentJob> for JobStatusView {
    fn from(job: &PaymentJob) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            state: job.state.as_str(),
            target_amount: job.target_amount,
            quote: job.quote.clone(),
            tx_refs: job.tx_refs.clone(),
            error: job.error.clone(),
            shortfall: job.shortfall,
            retry_count: job.retry_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            expires_at: job.expires_at,
        }
    }
}
