//! Merging entries from other replicas.
//!
//! A join runs in two phases. Resolution walks the `next` links of the incoming
//! entries with an explicit work queue, fetching every ancestor the log does not
//! hold yet, and validates the whole batch. Only when every entry passed does the
//! commit phase take the writer lock, persist the batch and move the heads. A
//! failure anywhere leaves the log exactly as it was.

use super::Log;
use crate::entry::{Entry, Hash};
use crate::storage::Storage;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

impl Log {
    /// Merge every entry of `other` into this log.
    ///
    /// Logs with a different id never share entries, so joining one is a no-op.
    /// Returns the newly added entries in causal order.
    pub async fn join(&self, other: &Log) -> Result<Vec<Entry>> {
        if other.id() != self.id() {
            debug!(log = %self.id(), other = %other.id(), "Skipping join with a different log");
            return Ok(Vec::new());
        }
        let heads = other.heads().await;
        self.join_entries(heads, other.storage().as_ref()).await
    }

    /// Merge a single entry, resolving its ancestors from this log's own storage.
    pub async fn join_entry(&self, entry: Entry) -> Result<Vec<Entry>> {
        let source = self.storage().clone();
        self.join_entries(vec![entry], source.as_ref()).await
    }

    /// Merge `entries` and every ancestor they depend on.
    ///
    /// Ancestors missing locally are fetched from `source`, each bounded by
    /// [`LogConfig::fetch_timeout`](crate::config::LogConfig::fetch_timeout). The
    /// join is all-or-nothing: if any entry fails validation or an ancestor cannot
    /// be fetched, nothing is added and the error is returned.
    pub async fn join_entries(
        &self,
        entries: Vec<Entry>,
        source: &dyn Storage,
    ) -> Result<Vec<Entry>> {
        let batch = match self.resolve(entries, source).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(log = %self.id(), error = %e, "Rejected join");
                return Err(e);
            }
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        if let Err(e) = self.validate_batch(&batch).await {
            warn!(log = %self.id(), error = %e, "Rejected join");
            return Err(e);
        }
        self.commit(batch).await
    }

    /// Collect the incoming entries and their missing ancestors.
    async fn resolve(
        &self,
        entries: Vec<Entry>,
        source: &dyn Storage,
    ) -> Result<HashMap<Hash, Entry>> {
        let mut batch: HashMap<Hash, Entry> = HashMap::new();
        // Hashes are marked when queued, so shared parents are fetched once and
        // parents carried in the same batch are never fetched at all
        let mut visited: HashSet<Hash> = HashSet::new();
        let mut pending: HashMap<Hash, Entry> = HashMap::new();
        let mut queue: VecDeque<Hash> = VecDeque::new();
        for entry in entries {
            if visited.insert(entry.hash().clone()) {
                queue.push_back(entry.hash().clone());
                pending.insert(entry.hash().clone(), entry);
            }
        }

        while let Some(hash) = queue.pop_front() {
            let Some(entry) = pending.remove(&hash) else {
                continue;
            };
            if self.has(&hash).await {
                continue;
            }
            if entry.log_id() != self.id() {
                return Err(Error::LogIdMismatch {
                    expected: self.id().to_string(),
                    found: entry.log_id().to_string(),
                });
            }

            for parent in entry.next() {
                if !visited.insert(parent.clone()) || self.has(parent).await {
                    continue;
                }
                // Refs are only shortcuts into the same history and are never fetched
                let parent_entry = self.fetch(parent, source).await?;
                queue.push_back(parent.clone());
                pending.insert(parent.clone(), parent_entry);
            }
            batch.insert(hash, entry);
        }
        Ok(batch)
    }

    /// Load and decode an entry, checking that its bytes match the requested hash.
    pub(super) async fn fetch(&self, hash: &str, source: &dyn Storage) -> Result<Entry> {
        let timeout = self.config().fetch_timeout();
        let bytes = match tokio::time::timeout(timeout, source.get(hash)).await {
            Err(_) => return Err(Error::Timeout(format!("fetching entry {hash}"))),
            Ok(Err(Error::Timeout(reason))) => return Err(Error::Timeout(reason)),
            Ok(Err(e)) => {
                return Err(Error::Resolution {
                    hash: hash.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(None)) => {
                return Err(Error::Resolution {
                    hash: hash.to_string(),
                    reason: "not found".to_string(),
                });
            }
            Ok(Ok(Some(bytes))) => bytes,
        };

        let entry = Entry::decode(&bytes)?;
        if !entry.verify_hash(hash) {
            return Err(Error::Validation(format!(
                "Entry stored under {hash} hashes to {}",
                entry.hash()
            )));
        }
        Ok(entry)
    }

    /// Check every entry of the batch, including its clock against its parents.
    async fn validate_batch(&self, batch: &HashMap<Hash, Entry>) -> Result<()> {
        for entry in batch.values() {
            self.validator
                .validate_entry(self.id(), self.access().as_ref(), entry)
                .await?;

            for parent in entry.next() {
                let parent_time = match batch.get(parent) {
                    Some(parent_entry) => parent_entry.clock().time,
                    None => self
                        .get(parent)
                        .await
                        .map(|parent_entry| parent_entry.clock().time)
                        .ok_or_else(|| Error::Resolution {
                            hash: parent.clone(),
                            reason: "parent missing after resolution".to_string(),
                        })?,
                };
                // A strictly increasing clock along every edge also rules out cycles
                if entry.clock().time <= parent_time {
                    return Err(Error::Validation(format!(
                        "Entry {} is not ahead of its parent {parent}",
                        entry.hash()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Persist a validated batch and advance the heads.
    async fn commit(&self, batch: HashMap<Hash, Entry>) -> Result<Vec<Entry>> {
        let mut state = self.state.write().await;

        // A concurrent join may have landed part of the batch meanwhile
        let mut added: Vec<Entry> = batch
            .into_values()
            .filter(|entry| !state.entries.contains_key(entry.hash()))
            .collect();
        if added.is_empty() {
            return Ok(added);
        }
        added.sort_by(|a, b| a.causal_cmp(b));

        for entry in &added {
            self.entries.put(entry.hash(), entry.encode()?).await?;
        }

        let referenced: HashSet<&Hash> = added.iter().flat_map(|entry| entry.next()).collect();
        let heads: BTreeSet<Hash> = state
            .heads
            .iter()
            .chain(added.iter().map(|entry| entry.hash()))
            .filter(|hash| !referenced.contains(hash))
            .cloned()
            .collect();
        let persisted: Vec<Hash> = heads.iter().cloned().collect();
        self.persist_heads(&persisted).await?;

        for entry in &added {
            state.clock.merge(entry.clock());
            state.entries.insert(entry.hash().clone(), entry.clone());
        }
        state.heads = heads;

        debug!(
            log = %self.id(),
            added = added.len(),
            heads = state.heads.len(),
            "Joined entries"
        );
        Ok(added)
    }
}
