//! Identity records and the default ed25519 identity.

use super::Identity;
use super::crypto::{format_public_key, generate_keypair, parse_public_key, sign_data, verify_signature};
use crate::Result;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Self-signatures proving that an identity's `id` and `public_key` belong together.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentitySignatures {
    /// Signature over `id`, made by the key `id` names.
    pub id: String,
    /// Signature over `public_key ++ signatures.id`, made by the key `id` names.
    pub public_key: String,
}

/// Public part of an identity, embedded in every entry it writes.
///
/// `id` is itself a formatted ed25519 public key (the "id key"); `public_key` is the
/// key entries are signed with. Both proofs are made by the id key, so a recipient
/// needs nothing beyond the record to check the binding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub public_key: String,
    pub signatures: IdentitySignatures,
    #[serde(rename = "type")]
    pub kind: String,
}

impl IdentityRecord {
    /// Check both self-proofs.
    ///
    /// Returns `Ok(false)` when a proof does not match and an error when a key or
    /// signature is malformed.
    pub fn verify(&self) -> Result<bool> {
        let id_key = parse_public_key(&self.id)?;
        // The signing key must at least parse before it is trusted for entries
        parse_public_key(&self.public_key)?;

        if !verify_signature(self.id.as_bytes(), &self.signatures.id, &id_key)? {
            return Ok(false);
        }
        let bound = proof_payload(&self.public_key, &self.signatures.id);
        verify_signature(&bound, &self.signatures.public_key, &id_key)
    }
}

fn proof_payload(public_key: &str, id_signature: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(public_key.len() + id_signature.len());
    payload.extend_from_slice(public_key.as_bytes());
    payload.extend_from_slice(id_signature.as_bytes());
    payload
}

/// Default identity backed by two in-memory ed25519 keys.
pub struct KeyIdentity {
    record: IdentityRecord,
    signing_key: SigningKey,
}

impl KeyIdentity {
    /// Generate a fresh id key and signing key.
    pub fn generate() -> Self {
        let (id_key, _) = generate_keypair();
        let (signing_key, _) = generate_keypair();
        Self::from_keys(&id_key, signing_key)
    }

    /// Build an identity from existing keys.
    ///
    /// The id key is only needed to produce the proofs and is not retained.
    pub fn from_keys(id_key: &SigningKey, signing_key: SigningKey) -> Self {
        let id = format_public_key(&id_key.verifying_key());
        let public_key = format_public_key(&signing_key.verifying_key());
        let id_signature = sign_data(id.as_bytes(), id_key);
        let key_signature = sign_data(&proof_payload(&public_key, &id_signature), id_key);

        Self {
            record: IdentityRecord {
                id,
                public_key,
                signatures: IdentitySignatures {
                    id: id_signature,
                    public_key: key_signature,
                },
                kind: "ed25519".to_string(),
            },
            signing_key,
        }
    }
}

impl Identity for KeyIdentity {
    fn record(&self) -> &IdentityRecord {
        &self.record
    }

    fn sign(&self, data: &[u8]) -> Result<String> {
        Ok(sign_data(data, &self.signing_key))
    }
}

impl fmt::Debug for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyIdentity")
            .field("id", &self.record.id)
            .field("public_key", &self.record.public_key)
            .finish_non_exhaustive()
    }
}
