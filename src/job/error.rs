//! Job Error Types

use thiserror::Error;

use crate::adapters::AdapterError;
use crate::credential::CredentialError;
use crate::quote::PlanError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone)]
pub enum JobError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Lifecycle Errors ===
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Job is already being executed: {0}")]
    AlreadyRunning(String),

    #[error("Confirmation window elapsed for job {0}")]
    Expired(String),

    #[error("Job record is inconsistent: {0}")]
    Corrupt(String),

    // === Collaborator Errors ===
    #[error("Planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("{0}")]
    Adapter(#[from] AdapterError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            JobError::InvalidAmount => "INVALID_AMOUNT",
            JobError::InvalidRequest(_) => "INVALID_REQUEST",
            JobError::JobNotFound(_) => "JOB_NOT_FOUND",
            JobError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            JobError::AlreadyRunning(_) => "ALREADY_RUNNING",
            JobError::Expired(_) => "EXPIRED",
            JobError::Corrupt(_) => "CORRUPT_JOB",
            JobError::Plan(e) => e.code(),
            JobError::Adapter(e) => e.code(),
            JobError::Credential(e) => e.code(),
            JobError::Store(_) => "STORE_ERROR",
        }
    }

    /// Errors from the store itself cannot be recorded on the job; the
    /// caller sees them instead and the job stays in its last durable state.
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            JobError::Store(_) | JobError::Credential(CredentialError::Store(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(JobError::InvalidAmount.code(), "INVALID_AMOUNT");
        assert_eq!(
            JobError::Adapter(AdapterError::Reverted("x".into())).code(),
            "REVERTED"
        );
        assert_eq!(
            JobError::Plan(PlanError::InvalidTarget).code(),
            "INVALID_TARGET"
        );
    }

    #[test]
    fn test_adapter_message_preserved() {
        let err = JobError::from(AdapterError::Transient("rpc timeout after 30s".into()));
        assert!(err.to_string().contains("rpc timeout after 30s"));
    }

    #[test]
    fn test_store_errors_flagged() {
        assert!(JobError::Store(StoreError::Unavailable("down".into())).is_store());
        assert!(!JobError::InvalidAmount.is_store());
    }
}
