//! Pluggable persistence for the store's entry table.
//!
//! The store writes its whole table under a single key through a
//! [`StorageBackend`], encoding it with an [`EntryCodec`]. Backends are byte
//! oriented; the codec decides the format.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache_entry::CacheEntry;
use crate::error::StoreError;

/// Byte-oriented key/value storage.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set_item(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn remove_item(&self, key: &str) -> Result<(), StoreError>;
}

/// Encodes and decodes a full entry table.
pub trait EntryCodec<T>: Send + Sync {
    fn encode(&self, entries: &[CacheEntry<T>]) -> Result<Vec<u8>, StoreError>;

    fn decode(&self, bytes: &[u8]) -> Result<Vec<CacheEntry<T>>, StoreError>;
}

/// Default codec: the table as a JSON array of entries.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> EntryCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, entries: &[CacheEntry<T>]) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(entries)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<CacheEntry<T>>, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// In-process backend, useful for tests and for sharing a table between clients.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.items.get(key).map(|item| item.value().clone()))
    }

    async fn set_item(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.items.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.items.remove(key);
        Ok(())
    }
}
