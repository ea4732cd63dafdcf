//! Publish/subscribe by topic.
//!
//! Databases broadcast every local entry on a topic named after their address and
//! learn about peers through the same subscription. [`PubSubNetwork`] is an
//! in-process broker that connects any number of [`MemoryPubSub`] peers.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

const TOPIC_CAPACITY: usize = 256;

/// Something observed on a subscribed topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PubSubEvent {
    Message { from: String, data: Vec<u8> },
    PeerJoined { peer: String },
    PeerLeft { peer: String },
}

/// Topic-based broadcast between peers.
///
/// A peer never receives its own messages.
#[async_trait]
pub trait PubSub: Send + Sync + fmt::Debug {
    fn peer_id(&self) -> &str;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    /// Join `topic`. Replaces any earlier subscription to the same topic.
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<PubSubEvent>>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Other peers currently subscribed to `topic`.
    async fn peers(&self, topic: &str) -> Result<Vec<String>>;
}

type Members = HashMap<String, broadcast::Sender<PubSubEvent>>;

/// Shared broker routing topics between [`MemoryPubSub`] instances.
#[derive(Clone, Debug, Default)]
pub struct PubSubNetwork {
    topics: Arc<RwLock<HashMap<String, Members>>>,
}

impl PubSubNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers currently subscribed to `topic`.
    pub async fn peers(&self, topic: &str) -> Vec<String> {
        let topics = self.topics.read().await;
        let mut peers: Vec<String> = topics
            .get(topic)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    async fn join(&self, topic: &str, peer: &str) -> broadcast::Receiver<PubSubEvent> {
        let (sender, receiver) = broadcast::channel(TOPIC_CAPACITY);
        let mut topics = self.topics.write().await;
        let members = topics.entry(topic.to_string()).or_default();

        for (existing, existing_sender) in members.iter() {
            if existing == peer {
                continue;
            }
            let _ = existing_sender.send(PubSubEvent::PeerJoined {
                peer: peer.to_string(),
            });
            let _ = sender.send(PubSubEvent::PeerJoined {
                peer: existing.clone(),
            });
        }
        members.insert(peer.to_string(), sender);
        receiver
    }

    async fn leave(&self, topic: &str, peer: &str) {
        let mut topics = self.topics.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return;
        };
        if members.remove(peer).is_none() {
            return;
        }
        for sender in members.values() {
            let _ = sender.send(PubSubEvent::PeerLeft {
                peer: peer.to_string(),
            });
        }
        if members.is_empty() {
            topics.remove(topic);
        }
    }

    async fn deliver(&self, topic: &str, from: &str, data: Vec<u8>) -> Result<()> {
        let topics = self.topics.read().await;
        let members = topics
            .get(topic)
            .filter(|members| members.contains_key(from))
            .ok_or_else(|| Error::Transport(format!("{from} is not subscribed to {topic}")))?;

        for (peer, sender) in members {
            if peer == from {
                continue;
            }
            // A member without live receivers is simply skipped
            let _ = sender.send(PubSubEvent::Message {
                from: from.to_string(),
                data: data.clone(),
            });
        }
        Ok(())
    }
}

/// One peer's handle onto a [`PubSubNetwork`].
#[derive(Clone, Debug)]
pub struct MemoryPubSub {
    peer_id: String,
    network: PubSubNetwork,
}

impl MemoryPubSub {
    pub fn new(peer_id: impl Into<String>, network: &PubSubNetwork) -> Self {
        Self {
            peer_id: peer_id.into(),
            network: network.clone(),
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        self.network.deliver(topic, &self.peer_id, data).await
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<PubSubEvent>> {
        self.network.leave(topic, &self.peer_id).await;
        let receiver = self.network.join(topic, &self.peer_id).await;
        tracing::debug!(peer = %self.peer_id, topic, "Subscribed");
        Ok(receiver)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.network.leave(topic, &self.peer_id).await;
        tracing::debug!(peer = %self.peer_id, topic, "Unsubscribed");
        Ok(())
    }

    async fn peers(&self, topic: &str) -> Result<Vec<String>> {
        let mut peers = self.network.peers(topic).await;
        peers.retain(|peer| peer != &self.peer_id);
        Ok(peers)
    }
}
