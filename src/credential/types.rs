//! Credential record and transient signing material

use ed25519_dalek::{Signer, SigningKey};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::CredentialError;

/// What a credential may be used for.
///
/// `allowed_contracts` is checked against the settlement contract only.
/// Conversion and bridge calls sign for whatever router or bridge the
/// adapter targets, so they are bounded by `spend_limit` and `expires_at`
/// alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialScope {
    /// Settlement contracts the credential may pay through; empty allows any
    #[serde(default)]
    pub allowed_contracts: Vec<String>,
    pub spend_limit: Decimal,
    /// Expiry timestamp (millis)
    pub expires_at: i64,
}

impl CredentialScope {
    pub fn allows(&self, counterpart: &str) -> bool {
        self.allowed_contracts.is_empty()
            || self
                .allowed_contracts
                .iter()
                .any(|c| c.eq_ignore_ascii_case(counterpart))
    }
}

/// Stored ephemeral credential, keyed by payer.
///
/// The signing key only exists encrypted here.
#[derive(Clone, PartialEq)]
pub struct CredentialRecord {
    pub payer: String,
    /// Hex of the ed25519 verifying key
    pub address: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub scope: CredentialScope,
    pub custody_ref: Option<String>,
    /// Bumped on every issue/rotate; a new version supersedes the old record
    pub version: i32,
    /// Authorized amounts by spend key
    pub spends: BTreeMap<String, Decimal>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CredentialRecord {
    pub fn spent(&self) -> Decimal {
        self.spends.values().copied().sum()
    }

    pub fn remaining(&self) -> Decimal {
        (self.scope.spend_limit - self.spent()).max(Decimal::ZERO)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.scope.expires_at
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("payer", &self.payer)
            .field("address", &self.address)
            .field("ciphertext", &"[REDACTED]")
            .field("nonce", &"[REDACTED]")
            .field("scope", &self.scope)
            .field("custody_ref", &self.custody_ref)
            .field("version", &self.version)
            .field("spent", &self.spent())
            .finish()
    }
}

/// Decrypted signing key, wiped on drop.
///
/// Obtain one per step, pass it to the signing call, let it drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningSecret {
    bytes: [u8; 32],
}

impl SigningSecret {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, CredentialError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CredentialError::InvalidKeyMaterial(format!(
                "expected 32 key bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    pub(crate) fn generate() -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            bytes: key.to_bytes(),
        }
    }

    pub(crate) fn expose_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn address(&self) -> String {
        hex::encode(SigningKey::from_bytes(&self.bytes).verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.bytes).sign(message).to_bytes()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret([REDACTED])")
    }
}

/// Identity that signs an adapter call
#[derive(Debug)]
pub enum SignerIdentity {
    /// Provider-custodied identity; the provider signs
    Delegated { custody_ref: String, address: String },
    /// The payer's own ephemeral key
    Raw(SigningSecret),
}

impl SignerIdentity {
    pub fn address(&self) -> String {
        match self {
            SignerIdentity::Delegated { address, .. } => address.clone(),
            SignerIdentity::Raw(secret) => secret.address(),
        }
    }

    pub fn is_delegated(&self) -> bool {
        matches!(self, SignerIdentity::Delegated { .. })
    }
}
