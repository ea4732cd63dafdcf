//!
//! Defines the storage trait and its implementations.
//!
//! The `Storage` trait is the only shared mutable resource in the system. Logs keep
//! their entries and heads in it and databases keep their head caches in it, which
//! lets the log logic stay independent of where bytes actually live.
//!
//! Three implementations are provided:
//! * [`MemoryStorage`]: a volatile map, optionally saved to and loaded from a file.
//! * [`BlockStorage`]: a content-addressed block store in front of a [`BlockService`].
//! * [`ComposedStorage`]: a fast front store layered over a durable back store.

use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::fmt;

mod block;
mod composed;
mod in_memory;

pub use block::{BlockService, BlockStorage, MemoryBlockService};
pub use composed::ComposedStorage;
pub use in_memory::MemoryStorage;

/// A finite stream of stored `(key, value)` pairs.
///
/// Each call to [`Storage::iter`] starts a fresh pass over the store.
pub type StorageStream = BoxStream<'static, Result<(String, Vec<u8>)>>;

/// Storage trait abstracting the underlying key to bytes store.
///
/// Implementations must tolerate one writer alongside many concurrent readers and
/// must never expose a partially written value. Iteration is not required to be
/// a consistent snapshot.
///
/// All implementations must be `Send` and `Sync` so a single store can be shared
/// by a log, its database and background replication tasks.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// Content-addressed implementations require `key` to be the address of `value`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Retrieves the value stored under `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Removes `key` if present.
    async fn del(&self, key: &str) -> Result<()>;

    /// Starts a lazy pass over all stored pairs.
    async fn iter(&self) -> Result<StorageStream>;

    /// Absorbs every pair stored in `other`.
    async fn merge(&self, other: &dyn Storage) -> Result<()> {
        let mut pairs = other.iter().await?;
        while let Some(pair) = pairs.next().await {
            let (key, value) = pair?;
            self.put(&key, value).await?;
        }
        Ok(())
    }

    /// Removes everything held by this store.
    async fn clear(&self) -> Result<()>;

    /// Releases any handles held by this store. Stored data is kept.
    async fn close(&self) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
