//! Content-addressed block storage.
//!
//! [`BlockStorage`] keeps entries in a [`BlockService`], where each block is addressed
//! by the CID of its bytes. Fetching a block may wait for the network, so reads are
//! bounded by a timeout and fail with [`Error::Timeout`] instead of hanging.

use super::{Storage, StorageStream};
use crate::entry::{Hash, content_address};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// A source and sink of content-addressed blocks.
///
/// `get_block` resolves once the block is available, which for a networked
/// service may be never. Callers bound it with a timeout.
#[async_trait]
pub trait BlockService: Send + Sync + fmt::Debug {
    async fn put_block(&self, cid: &str, bytes: Vec<u8>) -> Result<()>;

    /// Wait for the block with the given address.
    async fn get_block(&self, cid: &str) -> Result<Vec<u8>>;
}

/// An in-process block network.
///
/// Every [`BlockStorage`] built on a clone of the same service sees the blocks the
/// others publish, which makes it a stand-in for a real block exchange in tests
/// and single-process deployments.
#[derive(Clone, Debug, Default)]
pub struct MemoryBlockService {
    inner: Arc<BlockPool>,
}

#[derive(Debug, Default)]
struct BlockPool {
    blocks: RwLock<HashMap<Hash, Vec<u8>>>,
    arrived: Notify,
}

impl MemoryBlockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, cid: &str) -> Result<Option<Vec<u8>>> {
        let blocks = self
            .inner
            .blocks
            .read()
            .map_err(|_| Error::Storage("block pool lock poisoned".to_string()))?;
        Ok(blocks.get(cid).cloned())
    }
}

#[async_trait]
impl BlockService for MemoryBlockService {
    async fn put_block(&self, cid: &str, bytes: Vec<u8>) -> Result<()> {
        {
            let mut blocks = self
                .inner
                .blocks
                .write()
                .map_err(|_| Error::Storage("block pool lock poisoned".to_string()))?;
            blocks.insert(cid.to_string(), bytes);
        }
        self.inner.arrived.notify_waiters();
        Ok(())
    }

    async fn get_block(&self, cid: &str) -> Result<Vec<u8>> {
        loop {
            // Register interest before checking so a put between the check and
            // the await is not missed
            let arrived = self.inner.arrived.notified();
            if let Some(bytes) = self.lookup(cid)? {
                return Ok(bytes);
            }
            arrived.await;
        }
    }
}

/// Storage over a [`BlockService`].
///
/// Keys must be the content address of their value; `put` rejects anything else.
/// The storage tracks which blocks it has pinned, so `del` and `clear` only release
/// this node's interest and `iter` only lists pinned blocks.
#[derive(Debug)]
pub struct BlockStorage {
    service: Arc<dyn BlockService>,
    timeout: Duration,
    pinned: RwLock<BTreeSet<Hash>>,
}

impl BlockStorage {
    pub fn new(service: Arc<dyn BlockService>, timeout: Duration) -> Self {
        Self {
            service,
            timeout,
            pinned: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn pinned(&self) -> Result<BTreeSet<Hash>> {
        self.pinned
            .read()
            .map(|pinned| pinned.clone())
            .map_err(|_| Error::Storage("pin set lock poisoned".to_string()))
    }

    fn update_pins(&self, f: impl FnOnce(&mut BTreeSet<Hash>)) -> Result<()> {
        let mut pinned = self
            .pinned
            .write()
            .map_err(|_| Error::Storage("pin set lock poisoned".to_string()))?;
        f(&mut pinned);
        Ok(())
    }
}

#[async_trait]
impl Storage for BlockStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let address = content_address(&value)?;
        if address != key {
            return Err(Error::InvalidOperation(format!(
                "Block key {key} does not match content address {address}"
            )));
        }
        self.service.put_block(key, value).await?;
        self.update_pins(|pinned| {
            pinned.insert(address);
        })
    }

    /// Fetch a block, waiting at most the configured timeout.
    ///
    /// A block whose bytes do not hash to `key` is rejected.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let bytes = tokio::time::timeout(self.timeout, self.service.get_block(key))
            .await
            .map_err(|_| Error::Timeout(format!("block {key}")))??;

        if content_address(&bytes)? != key {
            return Err(Error::Validation(format!(
                "Block {key} does not match its content address"
            )));
        }
        Ok(Some(bytes))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.update_pins(|pinned| {
            pinned.remove(key);
        })
    }

    async fn iter(&self) -> Result<StorageStream> {
        let service = Arc::clone(&self.service);
        let keys = self.pinned()?;
        let stream = futures::stream::iter(keys).then(move |key| {
            let service = Arc::clone(&service);
            async move {
                let bytes = service.get_block(&key).await?;
                Ok((key, bytes))
            }
        });
        Ok(Box::pin(stream))
    }

    async fn clear(&self) -> Result<()> {
        self.update_pins(BTreeSet::clear)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Only pinned blocks count as present; this never waits on the network.
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.pinned()?.contains(key))
    }
}
