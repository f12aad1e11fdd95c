//! Byte-oriented key/value persistence.
//!
//! The engine consumes its store strictly as byte get/put/delete/scan. The
//! [`KvStore`] trait abstracts over backends:
//!
//! - **Disk**: [`RedbKvStore`] (pure Rust B-tree database)
//! - **Tests**: [`InMemoryKvStore`]
//!
//! Keys are raw bytes because document keys embed big-endian sequence ids
//! (see [`keys`]); values are opaque byte strings, JSON in practice.

pub mod keys;
mod redb_store;

pub use redb_store::RedbKvStore;

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Byte-oriented key/value store.
///
/// Prefix scans return entries in ascending byte order of their keys, which
/// for document keys equals seq-id order.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Retrieves the value stored under `key`, or `None`.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Stores `value` under `key`, overwriting any previous value.
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Deletes `key`. Succeeds even if the key was absent.
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Returns all `(key, value)` pairs whose key starts with `prefix`,
    /// ascending by key bytes.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Deletes every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let entries = self.scan_prefix(prefix).await?;
        let n = entries.len();
        for (key, _) in entries {
            self.delete(&key).await?;
        }
        Ok(n)
    }

    /// Number of keys under `prefix`.
    async fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        Ok(self.scan_prefix(prefix).await?.len())
    }
}

// Blanket implementation for Arc<T>, so a store can be shared between the
// registry, collections, and the analytics flusher.
#[async_trait::async_trait]
impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        (**self).delete(key).await
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        (**self).scan_prefix(prefix).await
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        (**self).delete_prefix(prefix).await
    }

    async fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        (**self).count_prefix(prefix).await
    }
}

/// In-memory store for tests and development.
///
/// A `BTreeMap` keeps keys in byte order so prefix scans behave exactly
/// like the disk backend.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryKvStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| Error::internal(format!("Lock poisoned: {}", e)))?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| Error::internal(format!("Lock poisoned: {}", e)))?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| Error::internal(format!("Lock poisoned: {}", e)))?;
        entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| Error::internal(format!("Lock poisoned: {}", e)))?;
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::keys;
    use super::*;

    #[tokio::test]
    async fn test_kv_crud() {
        let store = InMemoryKvStore::new();

        assert!(store.get(b"a").await.unwrap().is_none());

        store.put(b"a", b"1").await.unwrap();
        assert_eq!(store.get(b"a").await.unwrap().unwrap(), b"1");

        store.delete(b"a").await.unwrap();
        assert!(store.get(b"a").await.unwrap().is_none());

        // Deleting a missing key is fine
        store.delete(b"a").await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_prefix_in_seq_order() {
        let store = InMemoryKvStore::new();

        // Insert out of order; scan must come back in seq order because
        // document keys embed the seq id big-endian.
        for seq in [300u32, 2, 70_000, 1] {
            store
                .put(&keys::doc_key(1, seq), seq.to_string().as_bytes())
                .await
                .unwrap();
        }
        // A different collection must not leak into the scan.
        store.put(&keys::doc_key(2, 5), b"other").await.unwrap();

        let entries = store.scan_prefix(&keys::doc_key_prefix(1)).await.unwrap();
        let seqs: Vec<u32> = entries
            .iter()
            .map(|(k, _)| keys::seq_id_from_doc_key(k, 1).unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2, 300, 70_000]);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = InMemoryKvStore::new();
        for seq in 0..5u32 {
            store.put(&keys::doc_key(9, seq), b"x").await.unwrap();
        }
        store.put(b"$CM_other", b"y").await.unwrap();

        let removed = store.delete_prefix(&keys::doc_key_prefix(9)).await.unwrap();
        assert_eq!(removed, 5);
        assert_eq!(store.count_prefix(&keys::doc_key_prefix(9)).await.unwrap(), 0);
        assert!(store.get(b"$CM_other").await.unwrap().is_some());
    }
}
