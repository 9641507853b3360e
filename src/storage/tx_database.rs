// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable transactional store backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `records`: `(collection, key)` → raw bytes written by operation bodies
//!
//! Operation bodies never see redb directly. They receive a
//! [`StoreTransaction`] from [`TransactionalStore::begin`], and the executor
//! decides whether it is committed or rolled back.

use std::io;
use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};

use super::shared::{StoreError, StoreResult};

// =============================================================================
// Contracts
// =============================================================================

/// A store that hands out atomic write transactions.
pub trait TransactionalStore: Send + Sync {
    /// Open a write transaction.
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Read a committed value outside of any transaction.
    fn read(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// All committed `(key, value)` pairs of a collection, in key order.
    fn list(&self, collection: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;
}

/// An open write transaction. Writes become visible only on commit.
pub trait StoreTransaction {
    fn get(&mut self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn put(&mut self, collection: &str, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Returns whether a value was removed.
    fn delete(&mut self, collection: &str, key: &str) -> StoreResult<bool>;

    fn commit(self: Box<Self>) -> StoreResult<()>;

    fn rollback(self: Box<Self>) -> StoreResult<()>;
}

// =============================================================================
// Table Definitions
// =============================================================================

/// Every record written by operation bodies.
const RECORDS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("records");

// =============================================================================
// Error Mapping
// =============================================================================

/// Classify an I/O failure: contention-like kinds are retryable.
fn classify_io(e: &io::Error) -> StoreError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            StoreError::Transient(e.to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        match &e {
            redb::StorageError::Io(io_err) => classify_io(io_err),
            redb::StorageError::Corrupted(msg) => StoreError::Corrupt(msg.clone()),
            redb::StorageError::LockPoisoned(_) => StoreError::Transient(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        match e {
            redb::DatabaseError::Storage(inner) => inner.into(),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        match e {
            redb::TransactionError::Storage(inner) => inner.into(),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        match e {
            redb::TableError::Storage(inner) => inner.into(),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        match e {
            redb::CommitError::Storage(inner) => inner.into(),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

// =============================================================================
// RedbStore
// =============================================================================

/// Embedded ACID store for operation side effects.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| classify_io(&e))?;
        }
        let db = Database::create(path)?;

        // Pre-create the table so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl TransactionalStore for RedbStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let txn = self.db.begin_write()?;
        Ok(Box::new(RedbTransaction { txn }))
    }

    fn read(&self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;
        let value = table.get((collection, key))?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn list(&self, collection: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;

        let mut items = Vec::new();
        for entry in table.range((collection, "")..)? {
            let (key, value) = entry?;
            let (entry_collection, entry_key) = key.value();
            if entry_collection != collection {
                break;
            }
            items.push((entry_key.to_string(), value.value().to_vec()));
        }
        Ok(items)
    }
}

/// A redb write transaction. Dropping it without commit aborts it.
struct RedbTransaction {
    txn: WriteTransaction,
}

impl StoreTransaction for RedbTransaction {
    fn get(&mut self, collection: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(RECORDS)?;
        let value = table.get((collection, key))?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn put(&mut self, collection: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut table = self.txn.open_table(RECORDS)?;
        table.insert((collection, key), value)?;
        Ok(())
    }

    fn delete(&mut self, collection: &str, key: &str) -> StoreResult<bool> {
        let mut table = self.txn.open_table(RECORDS)?;
        let removed = table.remove((collection, key))?.is_some();
        Ok(removed)
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        self.txn.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.txn.abort()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("ops.redb")).unwrap();
        (store, dir)
    }

    #[test]
    fn committed_writes_are_visible() {
        let (store, _dir) = temp_store();
        let mut tx = store.begin().unwrap();
        tx.put("content", "a", b"first").unwrap();
        assert_eq!(tx.get("content", "a").unwrap(), Some(b"first".to_vec()));
        tx.commit().unwrap();

        assert_eq!(store.read("content", "a").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn rolled_back_writes_vanish() {
        let (store, _dir) = temp_store();
        let mut tx = store.begin().unwrap();
        tx.put("content", "a", b"draft").unwrap();
        tx.rollback().unwrap();

        assert_eq!(store.read("content", "a").unwrap(), None);
    }

    #[test]
    fn dropped_transaction_is_aborted() {
        let (store, _dir) = temp_store();
        {
            let mut tx = store.begin().unwrap();
            tx.put("content", "a", b"draft").unwrap();
        }
        assert_eq!(store.read("content", "a").unwrap(), None);
    }

    #[test]
    fn delete_reports_presence() {
        let (store, _dir) = temp_store();
        let mut tx = store.begin().unwrap();
        tx.put("media", "m1", b"x").unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert!(tx.delete("media", "m1").unwrap());
        assert!(!tx.delete("media", "m1").unwrap());
        tx.commit().unwrap();
        assert_eq!(store.read("media", "m1").unwrap(), None);
    }

    #[test]
    fn list_stays_within_collection() {
        let (store, _dir) = temp_store();
        let mut tx = store.begin().unwrap();
        tx.put("categories", "news", b"1").unwrap();
        tx.put("content", "b", b"2").unwrap();
        tx.put("content", "a", b"3").unwrap();
        tx.put("users", "u1", b"4").unwrap();
        tx.commit().unwrap();

        let items = store.list("content").unwrap();
        let keys: Vec<_> = items.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn timeouts_classify_as_transient() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "busy");
        assert!(classify_io(&timed_out).is_transient());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(!classify_io(&denied).is_transient());
    }
}
