//! Ephemeral signing credentials
//!
//! One credential per payer session: an ed25519 key encrypted at rest, a
//! scope (counterparts, spend limit, expiry) and an optional delegated
//! custody reference. Decrypted keys live only as long as one step.

pub mod cipher;
pub mod error;
pub mod manager;
pub mod types;

pub use cipher::CredentialCipher;
pub use error::CredentialError;
pub use manager::CredentialManager;
pub use types::{CredentialRecord, CredentialScope, SignerIdentity, SigningSecret};
