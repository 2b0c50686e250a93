//! Payment Job Orchestrator
//!
//! Resumable saga that gathers a payer's funds from several ledgers and pays
//! a recipient on one destination ledger.
//!
//! # State Machine
//!
//! ```text
//! SCANNING → ROUTING → [AWAITING_CONFIRMATION] → CONVERTING → BRIDGING → SETTLING → COMPLETE
//!                │               │
//!             FAILED          EXPIRED            (any executing step) ──▶ FAILED ──retry──▶ resume point
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Advance**: every side effect's reference is durable
//!    before the state moves past the step that produced it
//! 2. **Skip-If-Recorded**: a step whose reference exists is never re-issued
//! 3. **CAS Transitions**: a status change only applies from the expected
//!    state; the loser re-reads and stops
//! 4. **Idempotency**: all adapter calls carry the job id (plus step) as
//!    reference

pub mod coordinator;
pub mod error;
pub mod state;
pub mod types;
pub mod worker;


// Re-exports for convenience
pub use coordinator::{Adapters, CoordinatorConfig, JobCoordinator};
pub use error::JobError;
pub use state::JobState;
pub use types::{
    JobId, JobRequest, JobStatusView, JobStep, PaymentJob, SettlementMode, TxRefs,
};
pub use worker::{SweepConfig, SweepReport, SweepWorker};
