use super::{Storage, StorageStream};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;

/// A fast store layered over a slower, usually durable one.
///
/// Reads go to `front` first and fall through to `back` on a miss, copying the
/// value forward. Writes go to both, so `back` always holds everything.
#[derive(Debug, Clone)]
pub struct ComposedStorage {
    front: Arc<dyn Storage>,
    back: Arc<dyn Storage>,
}

impl ComposedStorage {
    pub fn new(front: Arc<dyn Storage>, back: Arc<dyn Storage>) -> Self {
        Self { front, back }
    }

    pub fn front(&self) -> &Arc<dyn Storage> {
        &self.front
    }

    pub fn back(&self) -> &Arc<dyn Storage> {
        &self.back
    }
}

#[async_trait]
impl Storage for ComposedStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.back.put(key, value.clone()).await?;
        self.front.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.front.get(key).await? {
            return Ok(Some(value));
        }
        match self.back.get(key).await? {
            Some(value) => {
                self.front.put(key, value.clone()).await?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.front.del(key).await?;
        self.back.del(key).await
    }

    /// Front pairs first, then back pairs the front did not already yield.
    async fn iter(&self) -> Result<StorageStream> {
        let mut seen = HashSet::new();
        let mut pairs = Vec::new();
        let mut front = self.front.iter().await?;
        while let Some(pair) = front.next().await {
            let (key, value) = pair?;
            seen.insert(key.clone());
            pairs.push(Ok((key, value)));
        }

        let back = self.back.iter().await?;
        let rest = back.filter(move |pair| {
            let fresh = match pair {
                Ok((key, _)) => !seen.contains(key),
                Err(_) => true,
            };
            futures::future::ready(fresh)
        });
        Ok(Box::pin(futures::stream::iter(pairs).chain(rest)))
    }

    async fn merge(&self, other: &dyn Storage) -> Result<()> {
        self.back.merge(other).await?;
        self.front.merge(other).await
    }

    async fn clear(&self) -> Result<()> {
        self.front.clear().await?;
        self.back.clear().await
    }

    async fn close(&self) -> Result<()> {
        self.front.close().await?;
        self.back.close().await
    }
}
