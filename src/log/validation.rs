//! Validation of entries received from other replicas.
//!
//! Every remote entry must pass, in order:
//! - format version
//! - log id
//! - identity self-proofs
//! - entry signature
//! - the access controller
//!
//! Causal linkage against parents is checked by the join itself, since it needs
//! the rest of the batch.

use crate::access::AccessController;
use crate::constants::ENTRY_VERSION;
use crate::entry::Entry;
use crate::identity::IdentityRecord;
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Mutex;

/// Validator for entries entering a log through `join`.
///
/// Identity proofs are identical on every entry a writer produces, so records that
/// verified once are cached and not checked again.
#[derive(Debug, Default)]
pub(crate) struct EntryValidator {
    verified_identities: Mutex<HashSet<IdentityRecord>>,
}

impl EntryValidator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Validate a single entry for the log `log_id`.
    ///
    /// # Arguments
    /// * `log_id` - Id of the log the entry is joining
    /// * `access` - Access controller of that log
    /// * `entry` - The entry to validate
    pub(crate) async fn validate_entry(
        &self,
        log_id: &str,
        access: &dyn AccessController,
        entry: &Entry,
    ) -> Result<()> {
        if entry.version() != ENTRY_VERSION {
            return Err(Error::Validation(format!(
                "Unsupported entry version {} in {}",
                entry.version(),
                entry.hash()
            )));
        }

        if entry.log_id() != log_id {
            return Err(Error::LogIdMismatch {
                expected: log_id.to_string(),
                found: entry.log_id().to_string(),
            });
        }

        self.verify_identity(entry.identity())?;

        match entry.verify_signature() {
            Ok(true) => {}
            Ok(false) => return Err(Error::InvalidSignature),
            Err(e) => {
                return Err(Error::Validation(format!(
                    "Unreadable signature on {}: {e}",
                    entry.hash()
                )));
            }
        }

        if !access.can_append(entry).await? {
            return Err(Error::PermissionDenied(format!(
                "{} may not append to log {log_id}",
                entry.identity().id
            )));
        }
        Ok(())
    }

    fn verify_identity(&self, record: &IdentityRecord) -> Result<()> {
        if self.is_cached(record)? {
            return Ok(());
        }

        match record.verify() {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::Validation(format!(
                    "Identity proofs do not match for {}",
                    record.id
                )));
            }
            Err(e) => {
                return Err(Error::Validation(format!(
                    "Malformed identity {}: {e}",
                    record.id
                )));
            }
        }

        self.verified_identities
            .lock()
            .map_err(|_| Error::Storage("identity cache lock poisoned".to_string()))?
            .insert(record.clone());
        Ok(())
    }

    fn is_cached(&self, record: &IdentityRecord) -> Result<bool> {
        let cache = self
            .verified_identities
            .lock()
            .map_err(|_| Error::Storage("identity cache lock poisoned".to_string()))?;
        Ok(cache.contains(record))
    }

    /// Forget every verified identity.
    #[cfg(test)]
    pub(crate) fn clear_cache(&self) {
        if let Ok(mut cache) = self.verified_identities.lock() {
            cache.clear();
        }
    }
}
