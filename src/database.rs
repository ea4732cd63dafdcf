//!
//! Databases: a log bound to an address and a broadcast channel.
//!
//! A [`Database`] appends local operations to its [`Log`], publishes each new entry
//! on the topic named after its address and merges entries published by peers.
//! Everything that happens is reported through [`DatabaseEvent`]s.
//!
//! Input from the network is untrusted, so [`Database::sync`] never fails: a
//! rejected message becomes a [`DatabaseEvent::Error`] and leaves the log untouched.

use crate::access::AccessController;
use crate::config::LogConfig;
use crate::constants::{LOCAL_HEADS, REMOTE_HEADS};
use crate::entry::{Entry, Hash, Payload};
use crate::identity::Identity;
use crate::log::{Log, LogOptions};
use crate::pubsub::{PubSub, PubSubEvent};
use crate::storage::{MemoryStorage, Storage};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 1024;

/// Notifications emitted by a [`Database`].
#[derive(Clone, Debug)]
pub enum DatabaseEvent {
    /// An entry was added, locally or from a peer.
    Update(Entry),
    /// A peer's entry was merged. Always followed by an `Update` for the same entry.
    Sync(Entry),
    /// A message from the network was rejected.
    Error(Arc<Error>),
    PeerJoined(String),
    PeerLeft(String),
    Closed,
    Dropped,
}

/// Collaborators for [`Database::open`].
#[derive(Clone, Debug)]
pub struct DatabaseOptions {
    pub address: String,
    pub identity: Arc<dyn Identity>,
    pub pubsub: Arc<dyn PubSub>,
    pub access: Option<Arc<dyn AccessController>>,
    pub entries: Option<Arc<dyn Storage>>,
    pub heads: Option<Arc<dyn Storage>>,
    /// Store for the local and remote heads records.
    pub cache: Option<Arc<dyn Storage>>,
    pub config: LogConfig,
}

impl DatabaseOptions {
    pub fn new(
        address: impl Into<String>,
        identity: Arc<dyn Identity>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        Self {
            address: address.into(),
            identity,
            pubsub,
            access: None,
            entries: None,
            heads: None,
            cache: None,
            config: LogConfig::default(),
        }
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

    pub fn cache(mut self, storage: Arc<dyn Storage>) -> Self {
        self.cache = Some(storage);
        self
    }

    pub fn config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug)]
struct DatabaseInner {
    address: String,
    log: Log,
    identity: Arc<dyn Identity>,
    pubsub: Arc<dyn PubSub>,
    cache: Arc<dyn Storage>,
    /// Serializes read-modify-write updates of the heads records.
    records: Mutex<()>,
    events: broadcast::Sender<DatabaseEvent>,
    subscription: CancellationToken,
    closed: AtomicBool,
}

/// A replicated dataset. Cheap to clone; clones share the same log.
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open the database and start listening on its topic.
    pub async fn open(options: DatabaseOptions) -> Result<Self> {
        let mut log_options = LogOptions::new()
            .id(options.address.clone())
            .config(options.config);
        log_options.access = options.access;
        log_options.entries = options.entries;
        log_options.heads = options.heads;
        let log = Log::open(options.identity.clone(), log_options).await?;

        let cache = options
            .cache
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let database = Self {
            inner: Arc::new(DatabaseInner {
                address: options.address,
                log,
                identity: options.identity,
                pubsub: options.pubsub,
                cache,
                records: Mutex::new(()),
                events,
                subscription: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        };

        let receiver = database
            .inner
            .pubsub
            .subscribe(&database.inner.address)
            .await?;
        database.spawn_listener(receiver);
        debug!(address = %database.address(), "Opened database");
        Ok(database)
    }

    /// Forward topic events into the database until it is closed.
    ///
    /// The task only holds a weak reference so dropping every handle stops it.
    fn spawn_listener(&self, mut receiver: broadcast::Receiver<PubSubEvent>) {
        let weak: Weak<DatabaseInner> = Arc::downgrade(&self.inner);
        let token = self.inner.subscription.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv() => event,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let database = Database { inner };
                match event {
                    Ok(PubSubEvent::Message { from, data }) => {
                        debug!(address = %database.address(), from = %from, "Received entry");
                        database.sync(&data).await;
                    }
                    Ok(PubSubEvent::PeerJoined { peer }) => {
                        database.emit(DatabaseEvent::PeerJoined(peer));
                    }
                    Ok(PubSubEvent::PeerLeft { peer }) => {
                        database.emit(DatabaseEvent::PeerLeft(peer));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(address = %database.address(), lagged = n, "Database subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn log(&self) -> &Log {
        &self.inner.log
    }

    pub fn identity(&self) -> &Arc<dyn Identity> {
        &self.inner.identity
    }

    /// Peers currently subscribed to this database's topic.
    pub async fn peers(&self) -> Result<Vec<String>> {
        self.inner.pubsub.peers(&self.inner.address).await
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: DatabaseEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Append a local operation and broadcast it to peers.
    pub async fn add_operation(&self, payload: Payload) -> Result<Entry> {
        self.ensure_open()?;
        let entry = self.inner.log.append(payload).await?;

        {
            let _records = self.inner.records.lock().await;
            self.write_heads(LOCAL_HEADS, std::slice::from_ref(entry.hash()))
                .await?;
            self.write_heads(REMOTE_HEADS, &[]).await?;
        }

        self.inner
            .pubsub
            .publish(&self.inner.address, entry.encode()?)
            .await?;
        self.emit(DatabaseEvent::Update(entry.clone()));
        Ok(entry)
    }

    /// Merge an encoded entry received from the network.
    ///
    /// Returns the entries that were added, which is empty when the message was
    /// rejected or already known. Rejections are reported as events.
    pub async fn sync(&self, bytes: &[u8]) -> Vec<Entry> {
        match Entry::decode(bytes) {
            Ok(entry) => self.sync_entry(entry).await,
            Err(e) => {
                self.reject(e);
                Vec::new()
            }
        }
    }

    /// Merge an already decoded entry. Same contract as [`Database::sync`].
    pub async fn sync_entry(&self, entry: Entry) -> Vec<Entry> {
        if let Err(e) = self.ensure_open() {
            self.reject(e);
            return Vec::new();
        }
        let hash = entry.hash().clone();
        let added = match self.inner.log.join_entry(entry).await {
            Ok(added) => added,
            Err(e) => {
                self.reject(e);
                return Vec::new();
            }
        };
        if added.is_empty() {
            return added;
        }

        if let Err(e) = self.record_remote_head(hash).await {
            self.reject(e);
        }
        for entry in &added {
            self.emit(DatabaseEvent::Sync(entry.clone()));
            self.emit(DatabaseEvent::Update(entry.clone()));
        }
        added
    }

    fn reject(&self, error: Error) {
        warn!(address = %self.address(), error = %error, "Rejected remote entry");
        self.emit(DatabaseEvent::Error(Arc::new(error)));
    }

    fn heads_record(&self, name: &str) -> String {
        format!("{}/{}", self.inner.address, name)
    }

    async fn read_heads(&self, name: &str) -> Result<Vec<Hash>> {
        match self.inner.cache.get(&self.heads_record(name)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write_heads(&self, name: &str, heads: &[Hash]) -> Result<()> {
        let bytes = serde_json::to_vec(heads)?;
        self.inner.cache.put(&self.heads_record(name), bytes).await
    }

    /// Remember a peer's head, keeping only those still at the frontier.
    async fn record_remote_head(&self, hash: Hash) -> Result<()> {
        let _records = self.inner.records.lock().await;
        let frontier: Vec<Hash> = self
            .inner
            .log
            .heads()
            .await
            .iter()
            .map(|head| head.hash().clone())
            .collect();
        let mut remote = self.read_heads(REMOTE_HEADS).await?;
        remote.push(hash);
        remote.sort();
        remote.dedup();
        remote.retain(|head| frontier.contains(head));
        self.write_heads(REMOTE_HEADS, &remote).await
    }

    /// The heads to offer a newly met peer.
    ///
    /// The log frontier comes first, followed by any recorded local heads and then
    /// cached remote heads it does not already cover.
    pub async fn exchange_heads(&self) -> Result<Vec<Entry>> {
        let mut heads = self.inner.log.heads().await;
        let mut recorded = self.read_heads(LOCAL_HEADS).await?;
        recorded.extend(self.read_heads(REMOTE_HEADS).await?);

        for hash in &recorded {
            if heads.iter().any(|head| head.hash() == hash) {
                continue;
            }
            if let Some(entry) = self.inner.log.get(hash).await {
                heads.push(entry);
            }
        }
        Ok(heads)
    }

    /// Stop listening and release storage. The data stays for a later reopen.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.subscription.cancel();
        self.inner.pubsub.unsubscribe(&self.inner.address).await?;
        self.inner.log.close().await?;
        self.inner.cache.close().await?;
        self.emit(DatabaseEvent::Closed);
        debug!(address = %self.address(), "Closed database");
        Ok(())
    }

    /// Stop listening and permanently remove the log and the heads records.
    pub async fn destroy(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.subscription.cancel();
            self.inner.pubsub.unsubscribe(&self.inner.address).await?;
        }
        self.inner.log.destroy().await?;
        self.inner.cache.clear().await?;
        self.emit(DatabaseEvent::Dropped);
        debug!(address = %self.address(), "Destroyed database");
        Ok(())
    }
}
