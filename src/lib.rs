//! Payflow - Cross-Ledger Payment Orchestration
//!
//! Gathers a payer's funds from several ledgers into one settlement asset on
//! a destination ledger and pays a recipient there, as a resumable job.
//!
//! # Modules
//!
//! - [`job`] - Job state machine, coordinator and sweep worker
//! - [`quote`] - Sourcing planner and fee estimation
//! - [`credential`] - Ephemeral signing credentials, encrypted at rest
//! - [`adapters`] - Balance, conversion, bridge, settlement and custody boundaries
//! - [`store`] - Job/credential persistence (in-memory and PostgreSQL)
//! - [`retry`] - Bounded retry and polling policies
//! - [`config`] - YAML application configuration
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod logging;
pub mod retry;

pub mod adapters;
pub mod credential;
pub mod job;
pub mod quote;
pub mod store;

// Convenient re-exports at crate root
pub use config::{AppConfig, ConfigError};
pub use credential::{CredentialCipher, CredentialManager};
pub use job::{
    Adapters, CoordinatorConfig, JobCoordinator, JobError, JobId, JobRequest, JobState,
    JobStatusView, SettlementMode, SweepWorker,
};
pub use quote::{BalanceSnapshot, LedgerBalance, LedgerId, Planner, Quote};
pub use store::{JobStore, MemoryStore, PgStore};
