//! Writer identities
//!
//! An identity binds a stable writer `id` to the public key that signs entries.
//! The binding is carried as two self-signatures inside an [`IdentityRecord`], which
//! is embedded in every entry so any recipient can check provenance on its own.
//!
//! The log only ever calls [`Identity::sign`] when appending and [`verify`] when
//! validating; key generation and storage stay behind the trait.

pub mod crypto;
mod types;

pub use types::{IdentityRecord, IdentitySignatures, KeyIdentity};

use crate::Result;
use std::fmt;

/// A writer capable of signing entries.
pub trait Identity: Send + Sync + fmt::Debug {
    /// The public record embedded in entries.
    fn record(&self) -> &IdentityRecord;

    /// Sign `data` with the entry signing key, returning an encoded signature.
    fn sign(&self, data: &[u8]) -> Result<String>;

    fn id(&self) -> &str {
        &self.record().id
    }

    fn public_key(&self) -> &str {
        &self.record().public_key
    }
}

/// Verify `signature` over `data` against a formatted public key.
pub fn verify(signature: &str, public_key: &str, data: &[u8]) -> Result<bool> {
    let key = crypto::parse_public_key(public_key)?;
    crypto::verify_signature(data, signature, &key)
}
