//! External Collaborators
//!
//! Boundaries to balance indexing, in-ledger conversion, cross-ledger
//! bridging, final settlement and delegated custody.
//!
//! Every side-effecting call takes a `reference` (job id plus step) and MUST
//! be idempotent on it: calling twice with the same reference has the effect
//! of calling once and returns the original receipt.

pub mod bridge;
pub mod http;
#[cfg(test)]
pub mod mock;

pub use bridge::{Attestation, AttestationApi, AttestationBridge, BurnClient, BurnReceipt};
pub use http::{HttpAttestationApi, HttpBalanceAggregator};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credential::SignerIdentity;
use crate::quote::{BalanceSnapshot, LedgerId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// RPC timeouts, indexer lag, 5xx. Message kept verbatim.
    #[error("{0}")]
    Transient(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Irreversible on-ledger failure
    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{op} timed out after {attempts} attempts")]
    Timeout { op: String, attempts: u32 },
}

impl AdapterError {
    /// Worth retrying inside the same step
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_) | AdapterError::RateLimited(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            AdapterError::Transient(_) => "TRANSIENT",
            AdapterError::RateLimited(_) => "RATE_LIMITED",
            AdapterError::Reverted(_) => "REVERTED",
            AdapterError::Rejected(_) => "REJECTED",
            AdapterError::InvalidResponse(_) => "INVALID_RESPONSE",
            AdapterError::Timeout { .. } => "TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionReceipt {
    pub tx_ref: String,
    /// Settlement asset actually received
    pub actual_output: Decimal,
}

/// One source-ledger group of a bridge transfer
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSource {
    pub ledger: LedgerId,
    /// Settlement asset to move (direct amounts plus converted outputs)
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeReceipt {
    /// Source-side burn transaction
    pub tx_ref: String,
    /// Destination-side mint transaction
    pub mint_tx: String,
    pub attestation: String,
    pub attestation_signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub tx_ref: String,
}

/// Read-only balance oracle. Results may be stale.
#[async_trait]
pub trait BalanceAggregator: Send + Sync {
    async fn scan(&self, address: &str) -> Result<BalanceSnapshot, AdapterError>;
}

#[async_trait]
pub trait ConversionAdapter: Send + Sync {
    /// Sell `native_amount` of `from_asset` for the settlement asset on `ledger`.
    async fn convert(
        &self,
        reference: &str,
        ledger: &LedgerId,
        from_asset: &str,
        native_amount: Decimal,
        signer: &SignerIdentity,
    ) -> Result<ConversionReceipt, AdapterError>;
}

#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    /// Move one source group to `recipient` on `dest_ledger`.
    async fn initiate_transfer(
        &self,
        reference: &str,
        source: &BridgeSource,
        dest_ledger: &LedgerId,
        recipient: &str,
        signer: &SignerIdentity,
    ) -> Result<BridgeReceipt, AdapterError>;
}

#[async_trait]
pub trait SettlementAdapter: Send + Sync {
    async fn pay(
        &self,
        recipient: &str,
        gross_amount: Decimal,
        reference: &str,
        signer: &SignerIdentity,
    ) -> Result<SettlementReceipt, AdapterError>;

    /// `weights_bps` sum to 10000
    async fn split_pay(
        &self,
        recipients: &[String],
        weights_bps: &[u32],
        gross_amount: Decimal,
        reference: &str,
        signer: &SignerIdentity,
    ) -> Result<SettlementReceipt, AdapterError>;
}

/// Creates provider-custodied signing identities
#[async_trait]
pub trait CustodyProvider: Send + Sync {
    /// Returns the custody reference for a new identity bound to `address`.
    async fn create_signer(&self, payer: &str, address: &str) -> Result<String, AdapterError>;
}
