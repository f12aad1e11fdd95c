//! Redb-backed key/value store.
//!
//! Uses [redb](https://github.com/cberner/redb) - a pure Rust, ACID-compliant,
//! embedded B-tree database. A single `&[u8] -> &[u8]` table holds every
//! engine key; the layout in [`super::keys`] keeps namespaces disjoint.

use super::KvStore;
use crate::error::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const ENGINE_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("fathom");

/// Redb-backed store for on-disk persistence.
///
/// All operations are ACID; prefix scans use the B-tree's ordered range
/// iterator, so document scans come back in seq-id order for free.
pub struct RedbKvStore {
    db: Arc<Database>,
}

impl RedbKvStore {
    /// Opens or creates a redb database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Database::create(path.as_ref())
            .map_err(|e| Error::internal(format!("Failed to open database: {}", e)))?;

        // Create the table up front so read transactions never race creation.
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::internal(format!("Failed to begin write transaction: {}", e)))?;
        write_txn
            .open_table(ENGINE_TABLE)
            .map_err(|e| Error::internal(format!("Failed to create table: {}", e)))?;
        write_txn
            .commit()
            .map_err(|e| Error::internal(format!("Failed to commit table creation: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait::async_trait]
impl KvStore for RedbKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::internal(format!("Failed to begin read transaction: {}", e)))?;
        let table = read_txn
            .open_table(ENGINE_TABLE)
            .map_err(|e| Error::internal(format!("Failed to open table: {}", e)))?;

        match table.get(key) {
            Ok(Some(guard)) => Ok(Some(guard.value().to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::internal(format!("Failed to get key: {}", e))),
        }
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::internal(format!("Failed to begin write transaction: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(ENGINE_TABLE)
                .map_err(|e| Error::internal(format!("Failed to open table: {}", e)))?;
            table
                .insert(key, value)
                .map_err(|e| Error::internal(format!("Failed to insert key: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::internal(format!("Failed to commit write: {}", e)))?;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::internal(format!("Failed to begin write transaction: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(ENGINE_TABLE)
                .map_err(|e| Error::internal(format!("Failed to open table: {}", e)))?;
            // Remove returns Ok(None) if the key didn't exist, which is fine
            table
                .remove(key)
                .map_err(|e| Error::internal(format!("Failed to delete key: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::internal(format!("Failed to commit deletion: {}", e)))?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::internal(format!("Failed to begin read transaction: {}", e)))?;
        let table = read_txn
            .open_table(ENGINE_TABLE)
            .map_err(|e| Error::internal(format!("Failed to open table: {}", e)))?;

        let mut entries = Vec::new();
        let iter = table
            .range(prefix..)
            .map_err(|e| Error::internal(format!("Failed to range scan: {}", e)))?;
        for result in iter {
            let (key, value) =
                result.map_err(|e| Error::internal(format!("Failed to read entry: {}", e)))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            entries.push((key.value().to_vec(), value.value().to_vec()));
        }

        Ok(entries)
    }
}
