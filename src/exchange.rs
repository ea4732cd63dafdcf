//! Heads exchange between directly connected peers.
//!
//! Broadcast only carries new writes, so a peer joining late would otherwise
//! learn about older history one entry at a time. When two peers meet on a
//! database topic they instead send each other a single [`HeadsMessage`] over a
//! direct channel; syncing those heads pulls in every missing ancestor through
//! storage, and both sides reach a shared frontier in one round trip.
//!
//! A failed exchange is logged and forgotten, so the next discovery of the same
//! peer tries again. Broadcast replication keeps working without it.

use crate::database::{Database, DatabaseEvent};
use crate::entry::Entry;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INBOX_CAPACITY: usize = 64;

/// The message peers trade on first contact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadsMessage {
    pub address: String,
    pub heads: Vec<Entry>,
}

impl HeadsMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message, deriving each head's hash from its content.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: HeadsMessage = serde_json::from_slice(bytes)?;
        let heads = message
            .heads
            .into_iter()
            .map(Entry::seal)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            address: message.address,
            heads,
        })
    }
}

/// Direct 1:1 channels between peers.
#[async_trait]
pub trait PeerTransport: Send + Sync + fmt::Debug {
    fn peer_id(&self) -> &str;

    /// Send `data` to `peer`, opening a channel if none is open yet.
    async fn send(&self, peer: &str, data: Vec<u8>) -> Result<()>;

    /// Wait for the next message from any peer. `None` once the transport is gone.
    async fn recv(&self) -> Option<(String, Vec<u8>)>;
}

type Inbox = mpsc::Sender<(String, Vec<u8>)>;

/// Shared broker connecting [`MemoryTransport`]s.
#[derive(Clone, Debug, Default)]
pub struct DirectNetwork {
    peers: Arc<Mutex<HashMap<String, Inbox>>>,
}

impl DirectNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` unreachable, as if its connection dropped.
    pub async fn disconnect(&self, peer: &str) {
        self.peers.lock().await.remove(peer);
    }
}

/// In-memory [`PeerTransport`].
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    peer_id: String,
    network: DirectNetwork,
    inbox: Arc<Mutex<mpsc::Receiver<(String, Vec<u8>)>>>,
}

impl MemoryTransport {
    pub async fn new(peer_id: impl Into<String>, network: &DirectNetwork) -> Self {
        let peer_id = peer_id.into();
        let (sender, receiver) = mpsc::channel(INBOX_CAPACITY);
        network.peers.lock().await.insert(peer_id.clone(), sender);
        Self {
            peer_id,
            network: network.clone(),
            inbox: Arc::new(Mutex::new(receiver)),
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, peer: &str, data: Vec<u8>) -> Result<()> {
        let inbox = self
            .network
            .peers
            .lock()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("Peer {peer} is not reachable")))?;
        inbox
            .send((self.peer_id.clone(), data))
            .await
            .map_err(|_| Error::Transport(format!("Channel to {peer} closed")))
    }

    async fn recv(&self) -> Option<(String, Vec<u8>)> {
        self.inbox.lock().await.recv().await
    }
}

#[derive(Debug)]
struct ExchangeInner {
    transport: Arc<dyn PeerTransport>,
    databases: RwLock<HashMap<String, (Database, CancellationToken)>>,
    /// `(address, peer)` pairs that have been sent our heads.
    exchanged: Mutex<HashSet<(String, String)>>,
    shutdown: CancellationToken,
}

/// Runs the heads exchange for every registered database.
#[derive(Clone, Debug)]
pub struct HeadsExchange {
    inner: Arc<ExchangeInner>,
}

impl HeadsExchange {
    /// Start answering incoming exchanges on `transport`.
    pub fn start(transport: Arc<dyn PeerTransport>) -> Self {
        let exchange = Self {
            inner: Arc::new(ExchangeInner {
                transport,
                databases: RwLock::new(HashMap::new()),
                exchanged: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        };

        let receiver = exchange.clone();
        let token = exchange.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    message = receiver.inner.transport.recv() => message,
                };
                let Some((from, bytes)) = message else {
                    break;
                };
                receiver.handle_message(&from, &bytes).await;
            }
        });
        exchange
    }

    /// Exchange heads for `database` with its current peers and every peer it
    /// meets from now on.
    pub async fn register(&self, database: Database) {
        let address = database.address().to_string();
        let token = self.inner.shutdown.child_token();
        let events = database.subscribe();
        let peers = database.peers().await;

        if let Some((_, previous)) = self
            .inner
            .databases
            .write()
            .await
            .insert(address.clone(), (database, token.clone()))
        {
            previous.cancel();
        }

        let exchange = self.clone();
        let watched = address.clone();
        tokio::spawn(async move {
            exchange.watch(watched, events, token).await;
        });

        match peers {
            Ok(peers) => {
                for peer in peers {
                    self.offer_heads(&address, &peer).await;
                }
            }
            Err(e) => warn!(address = %address, error = %e, "Could not list peers"),
        }
    }

    /// Stop exchanging heads for `address`.
    pub async fn unregister(&self, address: &str) {
        if let Some((_, token)) = self.inner.databases.write().await.remove(address) {
            token.cancel();
        }
        self.inner
            .exchanged
            .lock()
            .await
            .retain(|(exchanged, _)| exchanged != address);
    }

    /// Stop every task started by this exchange.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn watch(
        &self,
        address: String,
        mut events: broadcast::Receiver<DatabaseEvent>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(DatabaseEvent::PeerJoined(peer)) => self.offer_heads(&address, &peer).await,
                Ok(DatabaseEvent::PeerLeft(peer)) => {
                    self.forget(&address, &peer).await;
                }
                Ok(DatabaseEvent::Closed | DatabaseEvent::Dropped) => {
                    self.unregister(&address).await;
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(address = %address, lagged = n, "Heads exchange lagged behind database events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn database(&self, address: &str) -> Option<Database> {
        self.inner
            .databases
            .read()
            .await
            .get(address)
            .map(|(database, _)| database.clone())
    }

    async fn forget(&self, address: &str, peer: &str) {
        self.inner
            .exchanged
            .lock()
            .await
            .remove(&(address.to_string(), peer.to_string()));
    }

    /// Send our heads for `address` to `peer` unless already done.
    async fn offer_heads(&self, address: &str, peer: &str) {
        let key = (address.to_string(), peer.to_string());
        if !self.inner.exchanged.lock().await.insert(key) {
            return;
        }
        if let Err(e) = self.send_heads(address, peer).await {
            warn!(address, peer, error = %e, "Heads exchange failed, will retry on next discovery");
            self.forget(address, peer).await;
        }
    }

    async fn send_heads(&self, address: &str, peer: &str) -> Result<()> {
        let database = self.database(address).await.ok_or(Error::NotFound)?;
        let message = HeadsMessage {
            address: address.to_string(),
            heads: database.exchange_heads().await?,
        };
        let count = message.heads.len();
        self.inner.transport.send(peer, message.encode()?).await?;
        info!(address, peer, heads = count, "Sent heads");
        Ok(())
    }

    async fn handle_message(&self, from: &str, bytes: &[u8]) {
        let message = match HeadsMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = from, error = %e, "Dropped malformed heads message");
                return;
            }
        };
        let Some(database) = self.database(&message.address).await else {
            debug!(peer = from, address = %message.address, "Heads for an unknown database");
            return;
        };

        let mut added = 0;
        for head in message.heads {
            added += database.sync_entry(head).await.len();
        }
        info!(address = %message.address, peer = from, added, "Received heads");

        // Answer a peer that reached us before we reached it
        self.offer_heads(&message.address, from).await;
    }
}
