//!
//! The operation log.
//!
//! A [`Log`] is a grow-only set of signed entries forming a hash DAG. It tracks the
//! current frontier (`heads`), appends new entries on top of it and merges entries
//! from other replicas with [`Log::join`]. Every replica holding the same set of
//! entries reports the same [`Log::values`] sequence, whatever order they arrived in.
//!
//! Entries are kept in an in-memory arena keyed by hash and mirrored to a
//! [`Storage`], together with a small heads record that lets the log reopen
//! without replaying its whole history.

use crate::access::{AccessController, WriteAccess};
use crate::clock::Clock;
use crate::config::LogConfig;
use crate::constants::HEADS_KEY;
use crate::entry::{Entry, Hash, Payload, references};
use crate::identity::Identity;
use crate::storage::{MemoryStorage, Storage};
use crate::{Error, Result};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

mod join;
mod validation;

use validation::EntryValidator;

/// Collaborators and tunables for [`Log::open`].
///
/// Anything left unset falls back to a default: a random id, open write access
/// and fresh in-memory stores.
#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    pub id: Option<String>,
    pub access: Option<Arc<dyn AccessController>>,
    /// Store for entries, keyed by hash.
    pub entries: Option<Arc<dyn Storage>>,
    /// Store for the heads record.
    pub heads: Option<Arc<dyn Storage>>,
    pub config: LogConfig,
}

impl LogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn access(mut self, access: Arc<dyn AccessController>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn entries(mut self, storage: Arc<dyn Storage>) -> Self {
        self.entries = Some(storage);
        self
    }

    pub fn heads(mut self, storage: Arc<dyn Storage>) -> Self {
        self.heads = Some(storage);
        self
    }

    pub fn config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }
}

/// Per-call overrides for [`Log::append_with`].
#[derive(Clone, Debug, Default)]
pub struct AppendOptions {
    /// Overrides [`LogConfig::pointer_count`] for this entry.
    pub pointer_count: Option<usize>,
}

/// Bounds for [`Log::range`].
///
/// Bounds are entry hashes and refer to positions in the [`Log::values`] order.
#[derive(Clone, Debug, Default)]
pub struct RangeOptions {
    pub gt: Option<Hash>,
    pub gte: Option<Hash>,
    pub lt: Option<Hash>,
    pub lte: Option<Hash>,
    /// Maximum number of entries returned, newest first.
    pub amount: Option<usize>,
}

#[derive(Debug)]
struct LogState {
    entries: HashMap<Hash, Entry>,
    heads: BTreeSet<Hash>,
    /// Latest time seen on any entry, owned by the local writer.
    clock: Clock,
}

impl LogState {
    fn empty(writer: &str) -> Self {
        Self {
            entries: HashMap::new(),
            heads: BTreeSet::new(),
            clock: Clock::new(writer, 0),
        }
    }

    fn head_entries(&self) -> Vec<&Entry> {
        let mut heads: Vec<&Entry> = self
            .heads
            .iter()
            .filter_map(|hash| self.entries.get(hash))
            .collect();
        heads.sort_by(|a, b| a.causal_cmp(b));
        heads
    }

    /// Walk from `roots` towards the past, newest entry first.
    fn traverse(&self, roots: &[Hash], amount: Option<usize>) -> Vec<Entry> {
        let limit = amount.unwrap_or(usize::MAX);
        let mut seen = HashSet::new();
        let mut frontier = BinaryHeap::new();
        for root in roots {
            if let Some(entry) = self.entries.get(root) {
                if seen.insert(root.clone()) {
                    frontier.push(HeapEntry(entry));
                }
            }
        }

        let mut out = Vec::new();
        while out.len() < limit {
            let Some(HeapEntry(entry)) = frontier.pop() else {
                break;
            };
            for parent in entry.next() {
                if let Some(parent_entry) = self.entries.get(parent) {
                    if seen.insert(parent.clone()) {
                        frontier.push(HeapEntry(parent_entry));
                    }
                }
            }
            out.push(entry.clone());
        }
        out
    }

    fn sorted_values(&self) -> Vec<Entry> {
        let mut values: Vec<Entry> = self.entries.values().cloned().collect();
        values.sort_by(|a, b| a.causal_cmp(b));
        values
    }
}

/// Max-heap adapter ordering entries by their causal sort key.
struct HeapEntry<'a>(&'a Entry);

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.hash() == other.0.hash()
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.causal_cmp(other.0)
    }
}

/// A replicated, append-only log of signed entries.
///
/// Appends and joins serialize on an internal writer lock around the heads, so a
/// `Log` can be shared behind an `Arc` by a database and its replication tasks.
#[derive(Debug)]
pub struct Log {
    id: String,
    identity: Arc<dyn Identity>,
    access: Arc<dyn AccessController>,
    entries: Arc<dyn Storage>,
    heads_store: Arc<dyn Storage>,
    config: LogConfig,
    validator: EntryValidator,
    state: RwLock<LogState>,
}

impl Log {
    /// Open a log, restoring any entries reachable from the persisted heads.
    pub async fn open(identity: Arc<dyn Identity>, options: LogOptions) -> Result<Self> {
        let id = options
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let access = options
            .access
            .unwrap_or_else(|| Arc::new(WriteAccess::open()));
        let entries = options
            .entries
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let heads_store = options
            .heads
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let state = LogState::empty(identity.id());
        let log = Self {
            id,
            identity,
            access,
            entries,
            heads_store,
            config: options.config,
            validator: EntryValidator::new(),
            state: RwLock::new(state),
        };
        log.restore().await?;
        Ok(log)
    }

    async fn restore(&self) -> Result<()> {
        let Some(bytes) = self.heads_store.get(&self.heads_key()).await? else {
            return Ok(());
        };
        let heads: Vec<Hash> = serde_json::from_slice(&bytes)?;

        let mut loaded: HashMap<Hash, Entry> = HashMap::new();
        let mut queue: VecDeque<Hash> = heads.iter().cloned().collect();
        while let Some(hash) = queue.pop_front() {
            if loaded.contains_key(&hash) {
                continue;
            }
            let entry = self.fetch(&hash, self.entries.as_ref()).await?;
            queue.extend(entry.next().iter().cloned());
            loaded.insert(hash, entry);
        }

        let mut state = self.state.write().await;
        for entry in loaded.values() {
            state.clock.merge(entry.clock());
        }
        state.heads = heads.into_iter().collect();
        state.entries = loaded;
        debug!(log = %self.id, entries = state.entries.len(), heads = state.heads.len(), "Restored log");
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &Arc<dyn Identity> {
        &self.identity
    }

    pub fn access(&self) -> &Arc<dyn AccessController> {
        &self.access
    }

    /// Storage holding this log's entries.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.entries
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn heads_key(&self) -> String {
        format!("{}/{}", self.id, HEADS_KEY)
    }

    /// The local writer's clock: its id at the latest time seen in the log.
    pub async fn clock(&self) -> Clock {
        self.state.read().await.clock.clone()
    }

    /// Current frontier, in causal order.
    pub async fn heads(&self) -> Vec<Entry> {
        let state = self.state.read().await;
        state.head_entries().into_iter().cloned().collect()
    }

    /// Every entry, in the deterministic causal order shared by all replicas.
    pub async fn values(&self) -> Vec<Entry> {
        self.state.read().await.sorted_values()
    }

    pub async fn get(&self, hash: &str) -> Option<Entry> {
        self.state.read().await.entries.get(hash).cloned()
    }

    pub async fn has(&self, hash: &str) -> bool {
        self.state.read().await.entries.contains_key(hash)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Walk backwards from `roots` (the heads when empty), newest first.
    pub async fn traverse(&self, roots: &[Hash], amount: Option<usize>) -> Vec<Entry> {
        let state = self.state.read().await;
        if roots.is_empty() {
            let heads: Vec<Hash> = state.heads.iter().cloned().collect();
            state.traverse(&heads, amount)
        } else {
            state.traverse(roots, amount)
        }
    }

    /// A window of [`Log::values`], newest first.
    ///
    /// Fails with [`Error::NotFound`] if a bound names an unknown entry.
    pub async fn range(&self, options: RangeOptions) -> Result<Vec<Entry>> {
        let values = self.state.read().await.sorted_values();
        let position = |hash: &Option<Hash>| -> Result<Option<usize>> {
            match hash {
                None => Ok(None),
                Some(hash) => values
                    .iter()
                    .position(|entry| entry.hash() == hash)
                    .map(Some)
                    .ok_or(Error::NotFound),
            }
        };

        let mut start = 0;
        let mut end = values.len();
        if let Some(index) = position(&options.gt)? {
            start = start.max(index + 1);
        }
        if let Some(index) = position(&options.gte)? {
            start = start.max(index);
        }
        if let Some(index) = position(&options.lt)? {
            end = end.min(index);
        }
        if let Some(index) = position(&options.lte)? {
            end = end.min(index + 1);
        }
        if start >= end {
            return Ok(Vec::new());
        }

        let amount = options.amount.unwrap_or(usize::MAX);
        Ok(values[start..end].iter().rev().take(amount).cloned().collect())
    }

    /// Append a payload on top of the current heads.
    pub async fn append(&self, payload: Payload) -> Result<Entry> {
        self.append_with(payload, AppendOptions::default()).await
    }

    /// Append with per-call options.
    ///
    /// The access controller is consulted before anything is written; a refused
    /// append leaves the log unchanged.
    pub async fn append_with(&self, payload: Payload, options: AppendOptions) -> Result<Entry> {
        let mut state = self.state.write().await;

        let heads = state.head_entries();
        let next: Vec<Hash> = heads.iter().map(|head| head.hash().clone()).collect();
        let clock = state.clock.tick_past(heads.iter().map(|head| head.clock()));

        let pointer_count = options.pointer_count.unwrap_or(self.config.pointer_count);
        let history: Vec<Hash> = state
            .traverse(&next, Some(pointer_count))
            .iter()
            .map(|entry| entry.hash().clone())
            .collect();
        let refs = references(&history, pointer_count);

        let entry = Entry::create(
            self.identity.as_ref(),
            self.id.clone(),
            payload,
            clock,
            next,
            refs,
        )?;

        if !self.access.can_append(&entry).await? {
            return Err(Error::PermissionDenied(format!(
                "{} may not append to log {}",
                self.identity.id(),
                self.id
            )));
        }

        self.entries.put(entry.hash(), entry.encode()?).await?;
        self.persist_heads(std::slice::from_ref(entry.hash())).await?;

        state.heads = BTreeSet::from([entry.hash().clone()]);
        state.clock = entry.clock().clone();
        state.entries.insert(entry.hash().clone(), entry.clone());

        debug!(log = %self.id, hash = %entry.hash(), time = entry.clock().time, "Appended entry");
        Ok(entry)
    }

    async fn persist_heads(&self, heads: &[Hash]) -> Result<()> {
        let bytes = serde_json::to_vec(heads)?;
        self.heads_store.put(&self.heads_key(), bytes).await
    }

    /// Release storage handles. The log can be reopened from the same stores.
    pub async fn close(&self) -> Result<()> {
        self.entries.close().await?;
        self.heads_store.close().await
    }

    /// Permanently remove every entry and the heads record.
    pub async fn destroy(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.entries.clear().await?;
        self.heads_store.clear().await?;
        *state = LogState::empty(self.identity.id());
        debug!(log = %self.id, "Destroyed log");
        Ok(())
    }
}
