//! Job Coordinator
//!
//! Drives payment jobs through the state machine. This is the central
//! component: every step re-reads the persisted job, performs the side
//! effect of its current state, then persists the transition.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::JobError;
use super::state::JobState;
use super::types::{JobId, JobRequest, JobStatusView, JobStep, PaymentJob, SettlementMode};
use crate::adapters::{
    BalanceAggregator, BridgeAdapter, BridgeSource, ConversionAdapter, SettlementAdapter,
};
use crate::config::{AppConfig, OrchestratorConfig, RetryConfig};
use crate::credential::{CredentialManager, SignerIdentity};
use crate::quote::{BalanceSnapshot, LedgerId, PlanError, Planner, Quote};
use crate::retry::{RetryPolicy, poll_until, retry_transient};
use crate::store::{JobStore, StatusPatch, StoreError};

/// Upper bound on loop iterations of one `execute` call
const MAX_STEPS: usize = 32;

/// External collaborators the coordinator calls
#[derive(Clone)]
pub struct Adapters {
    pub balances: Arc<dyn BalanceAggregator>,
    pub converter: Arc<dyn ConversionAdapter>,
    pub bridge: Arc<dyn BridgeAdapter>,
    pub settlement: Arc<dyn SettlementAdapter>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub settlement_contract: String,
    /// Native asset symbol per ledger
    pub native_assets: HashMap<LedgerId, String>,
}

impl CoordinatorConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            orchestrator: config.orchestrator.clone(),
            retry: config.retry.clone(),
            settlement_contract: config.settlement.contract_address.clone(),
            native_assets: config
                .ledgers
                .iter()
                .map(|l| (LedgerId::new(l.id.clone()), l.native_asset.clone()))
                .collect(),
        }
    }
}

/// Result of one loop step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StepOutcome {
    state: JobState,
    /// False when this caller did not move the job (lost CAS or no-op)
    progressed: bool,
}

impl StepOutcome {
    fn moved(state: JobState) -> Self {
        Self {
            state,
            progressed: true,
        }
    }

    fn stay(state: JobState) -> Self {
        Self {
            state,
            progressed: false,
        }
    }
}

/// Marks a job as executed by this process until dropped
struct ActiveGuard<'a> {
    active: &'a DashMap<JobId, ()>,
    job_id: JobId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.job_id);
    }
}

pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
    credentials: Arc<CredentialManager>,
    planner: Arc<Planner>,
    adapters: Adapters,
    config: CoordinatorConfig,
    /// Snapshot taken in SCANNING, consumed by ROUTING of the same run
    snapshots: DashMap<JobId, BalanceSnapshot>,
    active: DashMap<JobId, ()>,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        credentials: Arc<CredentialManager>,
        planner: Arc<Planner>,
        adapters: Adapters,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            planner,
            adapters,
            config,
            snapshots: DashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a job in SCANNING.
    ///
    /// A request carrying a known `client_ref` returns the existing job id.
    pub async fn create(&self, req: JobRequest) -> Result<JobId, JobError> {
        if req.target_amount <= Decimal::ZERO {
            return Err(JobError::InvalidAmount);
        }
        if req.payer.trim().is_empty() {
            return Err(JobError::InvalidRequest("payer is required".into()));
        }
        match &req.settlement {
            SettlementMode::Direct { recipient } if recipient.trim().is_empty() => {
                return Err(JobError::InvalidRequest("recipient is required".into()));
            }
            SettlementMode::Split {
                recipients,
                weights_bps,
            } if recipients.is_empty() || recipients.len() != weights_bps.len() => {
                return Err(JobError::InvalidRequest(
                    "split recipients and weights must be non-empty and of equal length".into(),
                ));
            }
            _ => {}
        }

        if let Some(client_ref) = &req.client_ref
            && let Some(existing) = self.store.get_by_client_ref(client_ref).await?
        {
            debug!(client_ref = %client_ref, job_id = %existing.job_id, "Duplicate client_ref");
            return Ok(existing.job_id);
        }

        let credential = self.credentials.get(&req.payer).await?;
        let client_ref = req.client_ref.clone();
        let job = PaymentJob::new(JobId::new(), req, credential.address);

        match self.store.create_job(&job).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) if client_ref.is_some() => {
                let client_ref = client_ref.unwrap_or_default();
                return self
                    .store
                    .get_by_client_ref(&client_ref)
                    .await?
                    .map(|j| j.job_id)
                    .ok_or_else(|| JobError::JobNotFound(client_ref));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            job_id = %job.job_id,
            payer = %job.payer,
            target = %job.target_amount,
            auto_execute = job.auto_execute,
            "Payment job created"
        );
        Ok(job.job_id)
    }

    /// Create and run until the confirmation pause or a terminal state.
    pub async fn submit(&self, req: JobRequest) -> Result<JobStatusView, JobError> {
        let job_id = self.create(req).await?;
        self.execute(job_id).await?;
        self.status(job_id).await
    }

    /// Run the job loop; used for fresh jobs and for explicit resume.
    pub async fn execute(&self, job_id: JobId) -> Result<JobState, JobError> {
        let guard = self.claim(job_id)?;
        self.run(&guard).await
    }

    pub fn spawn(self: &Arc<Self>, job_id: JobId) -> JoinHandle<Result<JobState, JobError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.execute(job_id).await })
    }

    /// Move a quoted job into execution.
    ///
    /// Past the confirmation deadline the job becomes EXPIRED instead.
    pub async fn confirm(&self, job_id: JobId) -> Result<JobState, JobError> {
        let guard = self.claim(job_id)?;
        let job = self.load(job_id).await?;

        if job.state != JobState::AwaitingConfirmation {
            return Err(JobError::InvalidStateTransition(format!(
                "cannot confirm job in {}",
                job.state
            )));
        }

        if job.confirmation_elapsed(now_ms()) {
            self.store
                .update_status(
                    job_id,
                    JobState::AwaitingConfirmation,
                    JobState::Expired,
                    StatusPatch::new().error("confirmation window elapsed"),
                )
                .await?;
            info!(job_id = %job_id, "Confirmation arrived after expiry");
            return Err(JobError::Expired(job_id.to_string()));
        }

        let quote = job
            .quote
            .as_ref()
            .ok_or_else(|| JobError::Corrupt(format!("job {} has no quote", job_id)))?;
        let next = first_execution_state(quote);

        if !self
            .store
            .update_status(job_id, JobState::AwaitingConfirmation, next, StatusPatch::new())
            .await?
        {
            return Err(JobError::InvalidStateTransition(format!(
                "job {} changed state during confirm",
                job_id
            )));
        }
        info!(job_id = %job_id, next = %next, "Job confirmed");

        self.run(&guard).await
    }

    /// Resume a FAILED job from its last durably recorded step.
    pub async fn retry(&self, job_id: JobId) -> Result<JobState, JobError> {
        let guard = self.claim(job_id)?;
        let job = self.load(job_id).await?;

        if job.state != JobState::Failed {
            return Err(JobError::InvalidStateTransition(format!(
                "only FAILED jobs can be retried, job is {}",
                job.state
            )));
        }

        let resume = resume_point(&job);
        let patch = StatusPatch::retry(resume == JobState::Scanning);
        if !self
            .store
            .update_status(job_id, JobState::Failed, resume, patch)
            .await?
        {
            return Err(JobError::InvalidStateTransition(format!(
                "job {} is already being retried",
                job_id
            )));
        }
        info!(
            job_id = %job_id,
            resume = %resume,
            retry_count = job.retry_count + 1,
            "Retrying job"
        );

        self.run(&guard).await
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatusView, JobError> {
        Ok(self.load(job_id).await?.status_view())
    }

    /// Whether this process is currently executing the job
    pub fn is_active(&self, job_id: JobId) -> bool {
        self.active.contains_key(&job_id)
    }

    fn claim(&self, job_id: JobId) -> Result<ActiveGuard<'_>, JobError> {
        match self.active.entry(job_id) {
            Entry::Occupied(_) => Err(JobError::AlreadyRunning(job_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ActiveGuard {
                    active: &self.active,
                    job_id,
                })
            }
        }
    }

    async fn load(&self, job_id: JobId) -> Result<PaymentJob, JobError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))
    }

    async fn run(&self, guard: &ActiveGuard<'_>) -> Result<JobState, JobError> {
        let job_id = guard.job_id;
        let mut state = JobState::Scanning;

        for i in 0..MAX_STEPS {
            let job = self.load(job_id).await?;
            state = job.state;

            if state.is_terminal() || state.is_paused() {
                debug!(job_id = %job_id, state = %state, steps = i, "Job loop stopped");
                self.snapshots.remove(&job_id);
                return Ok(state);
            }

            let outcome = match self.advance(&job).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_store() => {
                    error!(job_id = %job_id, state = %state, error = %e, "Store failure, job left in last durable state");
                    return Err(e);
                }
                Err(e) => self.fail(&job, &e).await?,
            };

            if !outcome.progressed {
                self.snapshots.remove(&job_id);
                return Ok(outcome.state);
            }
            state = outcome.state;
        }

        warn!(
            job_id = %job_id,
            state = %state,
            "Job did not settle within iteration limit"
        );
        Ok(state)
    }

    async fn advance(&self, job: &PaymentJob) -> Result<StepOutcome, JobError> {
        match job.state {
            JobState::Scanning => self.step_scanning(job).await,
            JobState::Routing => self.step_routing(job).await,
            JobState::Converting => self.step_converting(job).await,
            JobState::Bridging => self.step_bridging(job).await,
            JobState::Settling => self.step_settling(job).await,
            JobState::AwaitingConfirmation
            | JobState::Complete
            | JobState::Failed
            | JobState::Expired => Ok(StepOutcome::stay(job.state)),
        }
    }

    /// CAS `job.state -> next`. Losing means another caller owns the job now.
    async fn transition(
        &self,
        job: &PaymentJob,
        next: JobState,
        patch: StatusPatch,
    ) -> Result<StepOutcome, JobError> {
        if self
            .store
            .update_status(job.job_id, job.state, next, patch)
            .await?
        {
            info!(job_id = %job.job_id, from = %job.state, to = %next, "Job state advanced");
            return Ok(StepOutcome::moved(next));
        }

        let current = self.load(job.job_id).await?;
        debug!(
            job_id = %job.job_id,
            expected = %job.state,
            current = %current.state,
            "Transition lost, job moved on"
        );
        Ok(StepOutcome::stay(current.state))
    }

    async fn fail(&self, job: &PaymentJob, err: &JobError) -> Result<StepOutcome, JobError> {
        error!(
            job_id = %job.job_id,
            state = %job.state,
            code = err.code(),
            error = %err,
            "Job step failed"
        );
        self.snapshots.remove(&job.job_id);
        let message = format!("{}: {}", job.state, err);
        let outcome = self
            .transition(job, JobState::Failed, StatusPatch::new().error(message))
            .await?;
        // A failure ends this run either way
        Ok(StepOutcome::stay(outcome.state))
    }

    fn policy_for(&self, signer: &SignerIdentity) -> &RetryPolicy {
        if signer.is_delegated() {
            &self.config.retry.adapter
        } else {
            &self.config.retry.indexer_lag
        }
    }

    fn quote_of<'a>(&self, job: &'a PaymentJob) -> Result<&'a Quote, JobError> {
        job.quote
            .as_ref()
            .ok_or_else(|| JobError::Corrupt(format!("job {} in {} has no quote", job.job_id, job.state)))
    }

    /// Poll balances with a fixed attempt budget. Never fails the job.
    async fn step_scanning(&self, job: &PaymentJob) -> Result<StepOutcome, JobError> {
        let attempts = self.config.orchestrator.scan_attempts.max(1);
        let delay = self.config.orchestrator.scan_delay();
        let mut snapshot = BalanceSnapshot::new();

        for attempt in 1..=attempts {
            match self.adapters.balances.scan(&job.funding_address).await {
                Ok(found) if found.values().any(|b| !b.is_empty()) => {
                    snapshot = found;
                    break;
                }
                Ok(found) => {
                    debug!(job_id = %job.job_id, attempt = attempt, "No balances found yet");
                    snapshot = found;
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, attempt = attempt, error = %e, "Balance scan failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        self.snapshots.insert(job.job_id, snapshot);
        self.transition(job, JobState::Routing, StatusPatch::new())
            .await
    }

    async fn step_routing(&self, job: &PaymentJob) -> Result<StepOutcome, JobError> {
        let snapshot = match self.snapshots.remove(&job.job_id) {
            Some((_, snapshot)) => snapshot,
            None => {
                let balances = self.adapters.balances.as_ref();
                let address = job.funding_address.as_str();
                retry_transient(&self.config.retry.adapter, "scan", move || {
                    balances.scan(address)
                })
                .await?
            }
        };

        match self.planner.plan(&snapshot, job.target_amount) {
            Ok(quote) => {
                let next = if job.auto_execute {
                    first_execution_state(&quote)
                } else {
                    JobState::AwaitingConfirmation
                };
                info!(
                    job_id = %job.job_id,
                    steps = quote.plan.len(),
                    payer_total = %quote.payer_total,
                    trivial = quote.trivial,
                    "Quote ready"
                );
                let mut patch = StatusPatch::new().quote(quote);
                if next == JobState::AwaitingConfirmation {
                    let ttl_ms = self.config.orchestrator.confirmation_ttl().as_millis() as i64;
                    patch = patch.expires_at(now_ms() + ttl_ms);
                }
                self.transition(job, next, patch).await
            }
            Err(PlanError::Infeasible {
                shortfall,
                required,
            }) => {
                let err = JobError::Plan(PlanError::Infeasible {
                    shortfall,
                    required,
                });
                warn!(job_id = %job.job_id, shortfall = %shortfall, required = %required, "Insufficient funds");
                let outcome = self
                    .transition(
                        job,
                        JobState::Failed,
                        StatusPatch::new()
                            .error(format!("{}: {}", job.state, err))
                            .shortfall(shortfall),
                    )
                    .await?;
                Ok(StepOutcome::stay(outcome.state))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn step_converting(&self, job: &PaymentJob) -> Result<StepOutcome, JobError> {
        let quote = self.quote_of(job)?;
        let spend_key = job.job_id.to_string();

        for step in quote.plan.iter().filter(|s| s.is_conversion()) {
            let job_step = JobStep::Convert(step.ledger.clone());
            if job.has_tx_ref(&job_step) {
                debug!(job_id = %job.job_id, step = %job_step, "Conversion already recorded");
                continue;
            }
            let native_amount = step.native_amount.ok_or_else(|| {
                JobError::Corrupt(format!("conversion on {} without native amount", step.ledger))
            })?;
            let from_asset = self
                .config
                .native_assets
                .get(&step.ledger)
                .ok_or_else(|| PlanError::UnknownLedger(step.ledger.to_string()))?;

            let signer = self
                .credentials
                .signer_for(&job.payer, &spend_key, quote.payer_total, None)
                .await?;
            let reference = format!("{}:{}", job.job_id, job_step);

            let receipt = {
                let converter = self.adapters.converter.as_ref();
                let (reference, ledger, from_asset, signer) =
                    (reference.as_str(), &step.ledger, from_asset.as_str(), &signer);
                retry_transient(self.policy_for(signer), "convert", move || {
                    converter.convert(reference, ledger, from_asset, native_amount, signer)
                })
                .await?
            };
            drop(signer);

            self.store
                .record_conversion(job.job_id, &step.ledger, &receipt.tx_ref, receipt.actual_output)
                .await?;
            info!(
                job_id = %job.job_id,
                ledger = %step.ledger,
                tx_ref = %receipt.tx_ref,
                planned = %step.amount,
                actual = %receipt.actual_output,
                "Conversion recorded"
            );
        }

        let next = if quote.needs_transfer() {
            JobState::Bridging
        } else {
            JobState::Settling
        };
        self.transition(job, next, StatusPatch::new()).await
    }

    async fn step_bridging(&self, job: &PaymentJob) -> Result<StepOutcome, JobError> {
        let quote = self.quote_of(job)?;
        let spend_key = job.job_id.to_string();
        let destination = self.planner.destination();

        for group in transfer_groups(quote) {
            let job_step = JobStep::Bridge(group.ledger.clone());
            if job.has_tx_ref(&job_step) {
                debug!(job_id = %job.job_id, step = %job_step, "Bridge transfer already recorded");
                continue;
            }

            let signer = self
                .credentials
                .signer_for(&job.payer, &spend_key, quote.payer_total, None)
                .await?;
            let reference = format!("{}:{}", job.job_id, job_step);

            let receipt = {
                let bridge = self.adapters.bridge.as_ref();
                let (reference, source, recipient, signer) = (
                    reference.as_str(),
                    &group,
                    job.funding_address.as_str(),
                    &signer,
                );
                retry_transient(self.policy_for(signer), "bridge", move || {
                    bridge.initiate_transfer(reference, source, destination, recipient, signer)
                })
                .await?
            };
            drop(signer);

            self.store
                .merge_tx_ref(job.job_id, &job_step, &receipt.tx_ref)
                .await?;
            info!(
                job_id = %job.job_id,
                source = %group.ledger,
                amount = %group.amount,
                tx_ref = %receipt.tx_ref,
                mint_tx = %receipt.mint_tx,
                "Bridge transfer recorded"
            );
        }

        let balances = self.adapters.balances.as_ref();
        let address = job.funding_address.as_str();
        let required = quote.settlement_gross;
        poll_until(
            &self.config.retry.destination_balance,
            "destination_balance",
            move || async move {
                let snapshot = balances.scan(address).await?;
                Ok(snapshot
                    .get(destination)
                    .filter(|b| b.settlement >= required)
                    .map(|_| ()))
            },
        )
        .await?;

        self.transition(job, JobState::Settling, StatusPatch::new())
            .await
    }

    async fn step_settling(&self, job: &PaymentJob) -> Result<StepOutcome, JobError> {
        if let Some(tx_ref) = job.tx_ref(&JobStep::Settle) {
            debug!(job_id = %job.job_id, tx_ref = %tx_ref, "Settlement already recorded");
            return self
                .transition(job, JobState::Complete, StatusPatch::new())
                .await;
        }

        let quote = self.quote_of(job)?;
        let secret = self
            .credentials
            .authorize_for_signing(
                &job.payer,
                &job.job_id.to_string(),
                quote.payer_total,
                Some(&self.config.settlement_contract),
            )
            .await?;
        let signer = SignerIdentity::Raw(secret);
        let reference = job.job_id.to_string();
        let gross = quote.settlement_gross;

        let receipt = {
            let settlement = self.adapters.settlement.as_ref();
            let (reference, signer) = (reference.as_str(), &signer);
            match &job.settlement {
                SettlementMode::Direct { recipient } => {
                    let recipient = recipient.as_str();
                    retry_transient(self.policy_for(signer), "settle", move || {
                        settlement.pay(recipient, gross, reference, signer)
                    })
                    .await?
                }
                SettlementMode::Split {
                    recipients,
                    weights_bps,
                } => {
                    let (recipients, weights_bps) = (recipients.as_slice(), weights_bps.as_slice());
                    retry_transient(self.policy_for(signer), "split_settle", move || {
                        settlement.split_pay(recipients, weights_bps, gross, reference, signer)
                    })
                    .await?
                }
            }
        };
        drop(signer);

        self.store
            .merge_tx_ref(job.job_id, &JobStep::Settle, &receipt.tx_ref)
            .await?;
        info!(
            job_id = %job.job_id,
            gross = %gross,
            recipient_amount = %quote.recipient_amount,
            tx_ref = %receipt.tx_ref,
            "Settlement recorded"
        );

        self.transition(job, JobState::Complete, StatusPatch::new())
            .await
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// First state after ROUTING/confirmation for a quote
pub(crate) fn first_execution_state(quote: &Quote) -> JobState {
    if !quote.trivial && quote.has_conversions() {
        JobState::Converting
    } else if quote.needs_transfer() {
        JobState::Bridging
    } else {
        JobState::Settling
    }
}

/// Transfer-needing steps grouped by source ledger, in plan order
pub(crate) fn transfer_groups(quote: &Quote) -> Vec<BridgeSource> {
    let mut groups: Vec<BridgeSource> = Vec::new();
    for step in quote.plan.iter().filter(|s| !s.no_transfer) {
        match groups.iter_mut().find(|g| g.ledger == step.ledger) {
            Some(group) => group.amount += step.available(),
            None => groups.push(BridgeSource {
                ledger: step.ledger.clone(),
                amount: step.available(),
            }),
        }
    }
    groups
}

/// Where a FAILED job resumes, judged by the references it recorded
pub(crate) fn resume_point(job: &PaymentJob) -> JobState {
    if job.has_tx_ref(&JobStep::Settle) {
        return JobState::Settling;
    }
    let Some(quote) = &job.quote else {
        return JobState::Scanning;
    };

    let bridged = job
        .tx_refs
        .keys()
        .any(|k| matches!(JobStep::from_key(k), Some(JobStep::Bridge(_))));
    if bridged {
        return JobState::Bridging;
    }

    let conversions: Vec<LedgerId> = quote
        .plan
        .iter()
        .filter(|s| s.is_conversion())
        .map(|s| s.ledger.clone())
        .collect();
    let recorded = conversions
        .iter()
        .filter(|l| job.has_tx_ref(&JobStep::Convert((*l).clone())))
        .count();

    if !conversions.is_empty() && recorded == conversions.len() {
        if quote.needs_transfer() {
            JobState::Bridging
        } else {
            JobState::Settling
        }
    } else if recorded > 0 {
        JobState::Converting
    } else {
        JobState::Scanning
    }
}
