use super::{Storage, StorageStream};
use crate::Error;
use crate::Result;
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A simple in-memory storage implementation using a `BTreeMap`.
///
/// This storage is suitable for testing, for caches in front of a durable store,
/// or for scenarios where persistence is handled externally (e.g., by saving and
/// loading the entire state to or from a file).
///
/// It provides basic persistence via `save_to_file` and `load_from_file`,
/// serializing the map to JSON with base64 values.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates a new, empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.values
            .read()
            .map_err(|_| Error::Storage("memory storage lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.values
            .write()
            .map_err(|_| Error::Storage("memory storage lock poisoned".to_string()))
    }

    /// Number of stored keys.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Saves the entire storage state to a specified file as JSON.
    ///
    /// # Arguments
    /// * `path` - The path to the file where the state should be saved.
    ///
    /// # Returns
    /// A `Result` indicating success or an I/O or serialization error.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded: BTreeMap<String, String> = self
            .read()?
            .iter()
            .map(|(key, value)| (key.clone(), Base64::encode_string(value)))
            .collect();
        let json = serde_json::to_string(&encoded)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Loads the storage state from a specified JSON file.
    ///
    /// If the file does not exist, a new, empty `MemoryStorage` is returned.
    ///
    /// # Arguments
    /// * `path` - The path to the file from which to load the state.
    ///
    /// # Returns
    /// A `Result` containing the loaded `MemoryStorage` or an I/O or deserialization error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::new());
        }

        let json = fs::read_to_string(path)?;
        let encoded: BTreeMap<String, String> = serde_json::from_str(&json)?;
        let mut values = BTreeMap::new();
        for (key, value) in encoded {
            let bytes = Base64::decode_vec(&value)
                .map_err(|e| Error::Storage(format!("Invalid stored value for {key}: {e}")))?;
            values.insert(key, bytes);
        }

        Ok(Self {
            values: RwLock::new(values),
        })
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write()?.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    /// Iterates over a copy of the pairs present when the call was made.
    async fn iter(&self) -> Result<StorageStream> {
        let pairs: Vec<Result<(String, Vec<u8>)>> = self
            .read()?
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.clone())))
            .collect();
        Ok(Box::pin(futures::stream::iter(pairs)))
    }

    async fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }

    /// Memory storage holds no external handles, so closing keeps the data
    /// available to whoever reopens it.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
