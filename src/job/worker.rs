//! Sweep Worker
//!
//! Background worker that expires unconfirmed quotes and picks up jobs a
//! dead process left mid-execution:
//!
//! - CONVERTING/BRIDGING past the stall threshold go to FAILED for operator
//!   inspection and are not retried automatically.
//! - SCANNING/ROUTING/SETTLING past the same threshold are re-driven through
//!   the coordinator. A worker without a coordinator fails them instead, so
//!   `retry` can resume them from their recorded references.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::coordinator::JobCoordinator;
use super::error::JobError;
use super::state::JobState;
use super::types::PaymentJob;
use crate::config::OrchestratorConfig;
use crate::store::{JobStore, StatusPatch, StoreError};

/// Configuration for the sweep worker
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often to sweep
    pub scan_interval: Duration,
    /// How long an executing job may go without an update
    pub stall_threshold: Duration,
    /// Maximum jobs handled per sweep and kind
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for SweepConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            scan_interval: config.sweep_interval(),
            stall_threshold: config.stall_threshold(),
            batch_size: config.sweep_batch_size,
        }
    }
}

/// Jobs moved by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub stalled: usize,
    /// Orphaned jobs re-driven by the coordinator
    pub resumed: usize,
    /// Orphaned jobs failed for lack of a coordinator
    pub interrupted: usize,
}

pub struct SweepWorker {
    store: Arc<dyn JobStore>,
    /// Re-drives orphaned jobs; jobs it is executing are left alone
    coordinator: Option<Arc<JobCoordinator>>,
    config: SweepConfig,
}

impl SweepWorker {
    pub fn new(store: Arc<dyn JobStore>, config: SweepConfig) -> Self {
        Self {
            store,
            coordinator: None,
            config,
        }
    }

    pub fn for_coordinator(coordinator: Arc<JobCoordinator>, config: SweepConfig) -> Self {
        Self {
            store: Arc::clone(coordinator.store()),
            coordinator: Some(coordinator),
            config,
        }
    }

    /// Run the sweep loop forever.
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stall_threshold_secs = self.config.stall_threshold.as_secs(),
            batch_size = self.config.batch_size,
            "Starting sweep worker"
        );

        loop {
            match self.sweep_once(chrono::Utc::now().timestamp_millis()).await {
                Ok(report) if report != SweepReport::default() => {
                    info!(
                        expired = report.expired,
                        stalled = report.stalled,
                        resumed = report.resumed,
                        interrupted = report.interrupted,
                        "Sweep moved jobs"
                    );
                }
                Ok(_) => debug!("Sweep found nothing to do"),
                Err(e) => error!(error = %e, "Sweep failed"),
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run every sweep once, as of `now_ms`.
    pub async fn sweep_once(&self, now_ms: i64) -> Result<SweepReport, StoreError> {
        let expired = self.expire_due(now_ms).await?;
        let stalled = self.fail_stalled(now_ms).await?;
        let (resumed, interrupted) = self.recover_in_flight(now_ms).await?;
        Ok(SweepReport {
            expired,
            stalled,
            resumed,
            interrupted,
        })
    }

    async fn expire_due(&self, now_ms: i64) -> Result<usize, StoreError> {
        let due = self
            .store
            .find_expired(now_ms, self.config.batch_size)
            .await?;

        let mut moved = 0;
        for job in due.iter().filter(|j| !self.is_local(j)) {
            if self
                .store
                .update_status(
                    job.job_id,
                    JobState::AwaitingConfirmation,
                    JobState::Expired,
                    StatusPatch::new().error("confirmation window elapsed"),
                )
                .await?
            {
                info!(job_id = %job.job_id, expires_at = ?job.expires_at, "Job expired");
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn fail_stalled(&self, now_ms: i64) -> Result<usize, StoreError> {
        let cutoff = now_ms - self.config.stall_threshold.as_millis() as i64;
        let stalled = self
            .store
            .find_stalled(cutoff, self.config.batch_size)
            .await?;

        let mut moved = 0;
        for job in stalled.iter().filter(|j| !self.is_local(j)) {
            let message = format!("stalled in {} for operator inspection", job.state);
            if self
                .store
                .update_status(
                    job.job_id,
                    job.state,
                    JobState::Failed,
                    StatusPatch::new().error(message),
                )
                .await?
            {
                warn!(
                    job_id = %job.job_id,
                    state = %job.state,
                    updated_at = job.updated_at,
                    tx_refs = job.tx_refs.len(),
                    "Stalled job failed, needs operator inspection"
                );
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn recover_in_flight(&self, now_ms: i64) -> Result<(usize, usize), StoreError> {
        let cutoff = now_ms - self.config.stall_threshold.as_millis() as i64;
        let orphaned = self
            .store
            .find_in_flight(cutoff, self.config.batch_size)
            .await?;

        let mut resumed = 0;
        let mut interrupted = 0;
        for job in orphaned.iter().filter(|j| !self.is_local(j)) {
            let Some(coordinator) = &self.coordinator else {
                let message = format!("interrupted in {}, retry to resume", job.state);
                if self
                    .store
                    .update_status(
                        job.job_id,
                        job.state,
                        JobState::Failed,
                        StatusPatch::new().error(message),
                    )
                    .await?
                {
                    warn!(
                        job_id = %job.job_id,
                        state = %job.state,
                        updated_at = job.updated_at,
                        "Orphaned job failed, awaiting retry"
                    );
                    interrupted += 1;
                }
                continue;
            };

            debug!(job_id = %job.job_id, state = %job.state, "Resuming orphaned job");
            match coordinator.execute(job.job_id).await {
                Ok(state) => {
                    if state != job.state {
                        info!(
                            job_id = %job.job_id,
                            old_state = %job.state,
                            new_state = %state,
                            "Orphaned job advanced"
                        );
                        resumed += 1;
                    }
                }
                Err(JobError::AlreadyRunning(_)) => {
                    debug!(job_id = %job.job_id, "Job picked up concurrently");
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "Failed to resume orphaned job");
                }
            }
        }
        Ok((resumed, interrupted))
    }

    fn is_local(&self, job: &PaymentJob) -> bool {
        let active = self
            .coordinator
            .as_ref()
            .is_some_and(|c| c.is_active(job.job_id));
        if active {
            debug!(job_id = %job.job_id, state = %job.state, "Skipping job executing in this process");
        }
        active
    }
}
