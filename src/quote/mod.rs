//! Sourcing Planner (Quote Engine)
//!
//! Turns a balance snapshot and a target amount into a deterministic
//! sourcing plan plus a buffered fee envelope.
//!
//! # Algorithm
//!
//! ```text
//! trivial?  destination already holds target + fees ──▶ single no-transfer step
//!    │
//!    ▼
//! prelim = allocate(target)          direct pass, then conversion pass
//! fees   = estimate(transfers(prelim), conversion_volume(prelim))
//! final  = allocate(target + fees)   infeasible if shortfall > tolerance
//! ```
//!
//! The two allocations are needed because the bridge fee depends on how many
//! ledgers the plan touches, which in turn depends on the amount required.

pub mod fee;
pub mod planner;
pub mod types;

pub use fee::{FeeBreakdown, FeePolicy};
pub use planner::{PlanError, Planner};
pub use types::{BalanceSnapshot, LedgerBalance, LedgerId, Quote, SourceStep, StepKind};
