//! Ephemeral Credential Manager
//!
//! Issues per-payer signing credentials, keeps them encrypted in the
//! [`CredentialStore`] and hands out short-lived signing material after
//! checking the credential's scope.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cipher::CredentialCipher;
use super::error::CredentialError;
use super::types::{CredentialRecord, CredentialScope, SignerIdentity, SigningSecret};
use crate::adapters::CustodyProvider;
use crate::config::CredentialConfig;
use crate::store::{CredentialStore, SpendOutcome};

pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<CredentialCipher>,
    custody: Option<Arc<dyn CustodyProvider>>,
    defaults: CredentialConfig,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cipher: Arc<CredentialCipher>,
        defaults: CredentialConfig,
    ) -> Self {
        Self {
            store,
            cipher,
            custody: None,
            defaults,
        }
    }

    /// Enable the delegated-custody signer path
    pub fn with_custody(mut self, provider: Arc<dyn CustodyProvider>) -> Self {
        self.custody = Some(provider);
        self
    }

    /// Scope using the configured TTL and spend limit
    pub fn default_scope(&self, allowed_contracts: Vec<String>) -> CredentialScope {
        let ttl_ms = (self.defaults.default_ttl_secs as i64).saturating_mul(1000);
        CredentialScope {
            allowed_contracts,
            spend_limit: self.defaults.default_spend_limit,
            expires_at: now_ms().saturating_add(ttl_ms),
        }
    }

    /// Generate a fresh key for `payer`, superseding any existing record.
    pub async fn issue(
        &self,
        payer: &str,
        scope: CredentialScope,
    ) -> Result<CredentialRecord, CredentialError> {
        let version = self
            .store
            .get_credential(payer)
            .await?
            .map(|r| r.version + 1)
            .unwrap_or(1);

        let secret = SigningSecret::generate();
        let address = secret.address();
        let (ciphertext, nonce) = self.cipher.encrypt(secret.expose_bytes())?;
        drop(secret);

        let now = now_ms();
        let record = CredentialRecord {
            payer: payer.to_string(),
            address,
            ciphertext,
            nonce,
            scope,
            custody_ref: None,
            version,
            spends: Default::default(),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_credential(&record).await?;

        info!(
            payer = %payer,
            address = %record.address,
            version = version,
            "Credential issued"
        );
        Ok(record)
    }

    /// Re-issue with the current scope. The new key has a new address and no
    /// custody reference.
    pub async fn rotate(&self, payer: &str) -> Result<CredentialRecord, CredentialError> {
        let current = self.get(payer).await?;
        self.issue(payer, current.scope).await
    }

    pub async fn get(&self, payer: &str) -> Result<CredentialRecord, CredentialError> {
        self.store
            .get_credential(payer)
            .await?
            .ok_or_else(|| CredentialError::NotFound(payer.to_string()))
    }

    /// Check scope, record the spend and decrypt the signing key.
    ///
    /// `spend_key` identifies the authorization (one per job). Authorizing the
    /// same key again only meters the increase over its recorded amount.
    pub async fn authorize_for_signing(
        &self,
        payer: &str,
        spend_key: &str,
        amount: Decimal,
        counterpart: Option<&str>,
    ) -> Result<SigningSecret, CredentialError> {
        let record = self.authorize(payer, spend_key, amount, counterpart).await?;
        self.decrypt(&record)
    }

    /// Like [`Self::authorize_for_signing`], but prefers a provider-custodied
    /// identity when a custody provider is configured.
    pub async fn signer_for(
        &self,
        payer: &str,
        spend_key: &str,
        amount: Decimal,
        counterpart: Option<&str>,
    ) -> Result<SignerIdentity, CredentialError> {
        let record = self.authorize(payer, spend_key, amount, counterpart).await?;

        let Some(custody) = &self.custody else {
            return Ok(SignerIdentity::Raw(self.decrypt(&record)?));
        };

        if let Some(custody_ref) = &record.custody_ref {
            return Ok(SignerIdentity::Delegated {
                custody_ref: custody_ref.clone(),
                address: record.address.clone(),
            });
        }

        match custody.create_signer(payer, &record.address).await {
            Ok(custody_ref) => {
                if self
                    .store
                    .set_custody_ref(payer, record.version, &custody_ref)
                    .await?
                {
                    info!(payer = %payer, custody_ref = %custody_ref, "Delegated signer cached");
                    return Ok(SignerIdentity::Delegated {
                        custody_ref,
                        address: record.address,
                    });
                }
                // Lost the race to another step, or the record was rotated
                let current = self.get(payer).await?;
                match current.custody_ref {
                    Some(existing) if current.version == record.version => {
                        Ok(SignerIdentity::Delegated {
                            custody_ref: existing,
                            address: current.address,
                        })
                    }
                    _ => Ok(SignerIdentity::Raw(self.decrypt(&record)?)),
                }
            }
            Err(e) => {
                warn!(
                    payer = %payer,
                    error = %e,
                    "Custody provider failed, falling back to raw credential"
                );
                Ok(SignerIdentity::Raw(self.decrypt(&record)?))
            }
        }
    }

    async fn authorize(
        &self,
        payer: &str,
        spend_key: &str,
        amount: Decimal,
        counterpart: Option<&str>,
    ) -> Result<CredentialRecord, CredentialError> {
        let record = self.get(payer).await?;

        if record.is_expired(now_ms()) {
            return Err(CredentialError::Expired(payer.to_string()));
        }
        if let Some(counterpart) = counterpart
            && !record.scope.allows(counterpart)
        {
            return Err(CredentialError::CounterpartNotAllowed(counterpart.to_string()));
        }

        match self.store.record_spend(payer, spend_key, amount).await? {
            SpendOutcome::Recorded => {
                debug!(payer = %payer, spend_key = %spend_key, amount = %amount, "Spend recorded");
            }
            SpendOutcome::AlreadyRecorded => {}
            SpendOutcome::LimitExceeded => {
                return Err(CredentialError::SpendLimitExceeded {
                    requested: amount,
                    remaining: record.remaining(),
                });
            }
        }
        Ok(record)
    }

    fn decrypt(&self, record: &CredentialRecord) -> Result<SigningSecret, CredentialError> {
        let plain = self.cipher.decrypt(&record.ciphertext, &record.nonce)?;
        let secret = SigningSecret::from_bytes(&plain)?;
        if secret.address() != record.address {
            return Err(CredentialError::InvalidKeyMaterial(
                "decrypted key does not match stored address".to_string(),
            ));
        }
        Ok(secret)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
