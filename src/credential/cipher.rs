//! At-rest encryption of credential keys (XChaCha20-Poly1305)

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use std::fmt;
use zeroize::Zeroizing;

use super::error::CredentialError;
use crate::config::{ConfigError, CredentialConfig};

pub const KEY_LEN: usize = 32;
/// XChaCha20 uses a 24-byte nonce
pub const NONCE_LEN: usize = 24;

pub struct CredentialCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl CredentialCipher {
    /// Read the hex key from the environment variable named in config.
    pub fn from_config(config: &CredentialConfig) -> Result<Self, ConfigError> {
        let raw = Zeroizing::new(
            std::env::var(&config.key_env)
                .map_err(|_| ConfigError::MissingCredentialKey(config.key_env.clone()))?,
        );
        Self::from_hex(&raw)
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, ConfigError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_key.trim())
                .map_err(|e| ConfigError::CredentialKeyEncoding(e.to_string()))?,
        );
        if bytes.len() != KEY_LEN {
            return Err(ConfigError::CredentialKeyLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Returns (ciphertext, nonce).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CredentialError> {
        let cipher = XChaCha20Poly1305::new((&*self.key).into());
        let mut nonce = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok((ciphertext, nonce.to_vec()))
    }

    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
        if nonce.len() != NONCE_LEN {
            return Err(CredentialError::Decryption(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        let cipher = XChaCha20Poly1305::new((&*self.key).into());
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| CredentialError::Decryption(e.to_string()))
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher([REDACTED])")
    }
}
