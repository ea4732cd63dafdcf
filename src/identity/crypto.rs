//! Cryptographic operations for Peerlog identities
//!
//! This module provides Ed25519 key handling, signature generation and
//! verification for identities and the entries they sign.

use crate::{Error, Result};
use base64ct::{Base64, Encoding};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

const KEY_PREFIX: &str = "ed25519:";

/// Parse a public key from string format
///
/// Expected format: "ed25519:<base64_encoded_key>"
/// The prefix "ed25519:" is required for crypto-agility
pub fn parse_public_key(key_str: &str) -> Result<VerifyingKey> {
    let key_data = key_str.strip_prefix(KEY_PREFIX).ok_or_else(|| {
        Error::InvalidKeyFormat("Key must start with 'ed25519:' prefix".to_string())
    })?;

    let key_bytes = Base64::decode_vec(key_data)
        .map_err(|e| Error::InvalidKeyFormat(format!("Invalid base64 for key: {e}")))?;

    let key_array: [u8; 32] = key_bytes.try_into().map_err(|_| {
        Error::InvalidKeyFormat("Ed25519 public key must be 32 bytes".to_string())
    })?;

    VerifyingKey::from_bytes(&key_array)
        .map_err(|e| Error::InvalidKeyFormat(format!("Invalid Ed25519 key: {e}")))
}

/// Format a public key as string
///
/// Returns format: "ed25519:<base64_encoded_key>"
pub fn format_public_key(key: &VerifyingKey) -> String {
    let encoded = Base64::encode_string(&key.to_bytes());
    format!("{KEY_PREFIX}{encoded}")
}

/// Generate an Ed25519 key pair
///
/// Uses cryptographically secure random number generation
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let mut rng = rand::rngs::OsRng;
    let signing_key = SigningKey::generate(&mut rng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

/// Sign data with an Ed25519 private key
///
/// Returns base64-encoded signature
pub fn sign_data(data: &[u8], signing_key: &SigningKey) -> String {
    let signature = signing_key.sign(data);
    Base64::encode_string(&signature.to_bytes())
}

/// Verify an Ed25519 signature
///
/// Malformed signatures are reported as `Error::InvalidSignature`; a well-formed
/// signature that does not match yields `Ok(false)`.
///
/// # Arguments
/// * `data` - The data that was signed
/// * `signature_base64` - Base64-encoded signature
/// * `verifying_key` - Public key for verification
pub fn verify_signature(
    data: &[u8],
    signature_base64: &str,
    verifying_key: &VerifyingKey,
) -> Result<bool> {
    let signature_bytes =
        Base64::decode_vec(signature_base64).map_err(|_| Error::InvalidSignature)?;

    let signature_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;

    let signature = Signature::from_bytes(&signature_array);

    Ok(verifying_key.verify(data, &signature).is_ok())
}
