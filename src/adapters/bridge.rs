//! Attestation-based bridge
//!
//! Three-step flow: burn on the source ledger, poll the provider for an
//! attestation of the burn, mint on the destination with that attestation.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::{AdapterError, BridgeAdapter, BridgeReceipt, BridgeSource};
use crate::credential::SignerIdentity;
use crate::quote::LedgerId;
use crate::retry::{RetryPolicy, poll_until};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurnReceipt {
    pub tx_ref: String,
    /// Amount burned (input amount, before bridge fees)
    pub amount: Decimal,
}

/// Provider-signed proof of a burn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub message: String,
    pub signature: String,
}

/// Ledger-side calls of the bridge protocol
#[async_trait]
pub trait BurnClient: Send + Sync {
    async fn burn(
        &self,
        reference: &str,
        source: &BridgeSource,
        dest_ledger: &LedgerId,
        recipient: &str,
        signer: &SignerIdentity,
    ) -> Result<BurnReceipt, AdapterError>;

    /// Returns the mint transaction reference.
    async fn mint(
        &self,
        reference: &str,
        dest_ledger: &LedgerId,
        attestation: &Attestation,
        signer: &SignerIdentity,
    ) -> Result<String, AdapterError>;
}

/// Attestation provider
#[async_trait]
pub trait AttestationApi: Send + Sync {
    /// `None` while the attestation is not available yet
    async fn fetch(
        &self,
        source_ledger: &LedgerId,
        burn_tx: &str,
    ) -> Result<Option<Attestation>, AdapterError>;
}

pub struct AttestationBridge {
    burner: Arc<dyn BurnClient>,
    api: Arc<dyn AttestationApi>,
    attestation_policy: RetryPolicy,
}

impl AttestationBridge {
    pub fn new(
        burner: Arc<dyn BurnClient>,
        api: Arc<dyn AttestationApi>,
        attestation_policy: RetryPolicy,
    ) -> Self {
        Self {
            burner,
            api,
            attestation_policy,
        }
    }
}

#[async_trait]
impl BridgeAdapter for AttestationBridge {
    async fn initiate_transfer(
        &self,
        reference: &str,
        source: &BridgeSource,
        dest_ledger: &LedgerId,
        recipient: &str,
        signer: &SignerIdentity,
    ) -> Result<BridgeReceipt, AdapterError> {
        let burn = self
            .burner
            .burn(reference, source, dest_ledger, recipient, signer)
            .await?;
        debug!(
            reference = %reference,
            ledger = %source.ledger,
            burn_tx = %burn.tx_ref,
            amount = %burn.amount,
            "Burn confirmed, waiting for attestation"
        );

        let api = self.api.as_ref();
        let ledger = &source.ledger;
        let burn_tx = burn.tx_ref.as_str();
        let attestation = poll_until(&self.attestation_policy, "attestation", move || {
            api.fetch(ledger, burn_tx)
        })
        .await?;

        let mint_tx = self
            .burner
            .mint(reference, dest_ledger, &attestation, signer)
            .await?;

        info!(
            reference = %reference,
            source = %source.ledger,
            dest = %dest_ledger,
            burn_tx = %burn.tx_ref,
            mint_tx = %mint_tx,
            "Bridge transfer complete"
        );

        Ok(BridgeReceipt {
            tx_ref: burn.tx_ref,
            mint_tx,
            attestation: attestation.message,
            attestation_signature: attestation.signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::SigningSecret;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FakeBurner {
        burns: AtomicU32,
        mints: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BurnClient for FakeBurner {
        async fn burn(
            &self,
            reference: &str,
            source: &BridgeSource,
            _dest_ledger: &LedgerId,
            _recipient: &str,
            _signer: &SignerIdentity,
        ) -> Result<BurnReceipt, AdapterError> {
            self.burns.fetch_add(1, Ordering::SeqCst);
            Ok(BurnReceipt {
                tx_ref: format!("burn-{}", reference),
                amount: source.amount,
            })
        }

        async fn mint(
            &self,
            _reference: &str,
            _dest_ledger: &LedgerId,
            attestation: &Attestation,
            _signer: &SignerIdentity,
        ) -> Result<String, AdapterError> {
            self.mints.lock().unwrap().push(attestation.message.clone());
            Ok("mint-1".to_string())
        }
    }

    /// Pending for the first `pending` polls
    struct SlowApi {
        pending: u32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl AttestationApi for SlowApi {
        async fn fetch(
            &self,
            _source_ledger: &LedgerId,
            burn_tx: &str,
        ) -> Result<Option<Attestation>, AdapterError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending {
                return Ok(None);
            }
            Ok(Some(Attestation {
                message: format!("msg:{}", burn_tx),
                signature: "sig".to_string(),
            }))
        }
    }

    fn bridge(pending: u32, attempts: u32) -> (AttestationBridge, Arc<FakeBurner>) {
        let burner = Arc::new(FakeBurner {
            burns: AtomicU32::new(0),
            mints: Mutex::new(Vec::new()),
        });
        let api = Arc::new(SlowApi {
            pending,
            polls: AtomicU32::new(0),
        });
        let policy = RetryPolicy::fixed(attempts, Duration::from_millis(1));
        (AttestationBridge::new(burner.clone(), api, policy), burner)
    }

    fn source() -> BridgeSource {
        BridgeSource {
            ledger: LedgerId::from("arbitrum"),
            amount: dec!(20),
        }
    }

    #[tokio::test]
    async fn test_burn_attest_mint() {
        let (bridge, burner) = bridge(2, 5);
        let signer = SignerIdentity::Raw(SigningSecret::generate());
        let receipt = bridge
            .initiate_transfer("job-1:bridge", &source(), &LedgerId::from("base"), "0xf", &signer)
            .await
            .unwrap();

        assert_eq!(receipt.tx_ref, "burn-job-1:bridge");
        assert_eq!(receipt.mint_tx, "mint-1");
        assert_eq!(receipt.attestation, "msg:burn-job-1:bridge");
        assert_eq!(receipt.attestation_signature, "sig");
        assert_eq!(burner.burns.load(Ordering::SeqCst), 1);
        assert_eq!(burner.mints.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attestation_polling_times_out() {
        let (bridge, burner) = bridge(100, 3);
        let signer = SignerIdentity::Raw(SigningSecret::generate());
        let err = bridge
            .initiate_transfer("job-2:bridge", &source(), &LedgerId::from("base"), "0xf", &signer)
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::Timeout { attempts: 3, .. }));
        assert!(burner.mints.lock().unwrap().is_empty());
    }
}
