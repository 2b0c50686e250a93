use rust_decimal::Decimal;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug, Clone)]
pub enum CredentialError {
    #[error("No credential for payer {0}")]
    NotFound(String),

    #[error("Credential for payer {0} has expired")]
    Expired(String),

    #[error("Counterpart {0} is outside the credential scope")]
    CounterpartNotAllowed(String),

    #[error("Spend limit exceeded: requested {requested}, remaining {remaining}")]
    SpendLimitExceeded {
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CredentialError {
    pub fn code(&self) -> &'static str {
        match self {
            CredentialError::NotFound(_) => "CREDENTIAL_NOT_FOUND",
            CredentialError::Expired(_) => "CREDENTIAL_EXPIRED",
            CredentialError::CounterpartNotAllowed(_) => "COUNTERPART_NOT_ALLOWED",
            CredentialError::SpendLimitExceeded { .. } => "SPEND_LIMIT_EXCEEDED",
            CredentialError::Encryption(_) => "ENCRYPTION_FAILED",
            CredentialError::Decryption(_) => "DECRYPTION_FAILED",
            CredentialError::InvalidKeyMaterial(_) => "INVALID_KEY_MATERIAL",
            CredentialError::Store(_) => "STORE_ERROR",
        }
    }
}
