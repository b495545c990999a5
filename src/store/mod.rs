pub mod btree;
pub mod lsm;

use std::collections::BTreeMap;

use crate::error::Result;

pub use btree::BtreeStore;
pub use lsm::LsmStore;

/// The storage port: an ordered byte-string to byte-string map with
/// point-lookup semantics. Both backends implement it; the database layer
/// consumes nothing else.
pub trait Storage: Send + Sync {
    /// Inserts or updates a key-value pair.
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Retrieves the value for a key, failing with `Error::KeyNotFound` if
    /// absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Removes a key, failing with `Error::KeyNotFound` if absent.
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// A storage backend selected once at construction. Calls dispatch through
/// a single match, so the hot path never goes through a vtable.
pub enum StorageEngine {
    Btree(BtreeStore),
    Lsm(LsmStore),
}

impl StorageEngine {
    /// Gracefully shuts down the backend: B-tree state is already durable,
    /// the LSM store flushes its memtable and stops its workers.
    pub fn close(&self) -> Result<()> {
        match self {
            StorageEngine::Btree(_) => Ok(()),
            StorageEngine::Lsm(store) => store.close(),
        }
    }

    /// Backend statistics as a key-value map. The B-tree reports its item
    /// count; the LSM store reports its full counter set.
    pub fn stats(&self) -> BTreeMap<String, u64> {
        match self {
            StorageEngine::Btree(store) => {
                let mut stats = BTreeMap::new();
                stats.insert("length".to_string(), store.len() as u64);
                stats
            }
            StorageEngine::Lsm(store) => store.stats(),
        }
    }
}

impl Storage for StorageEngine {
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        match self {
            StorageEngine::Btree(store) => store.insert(key, value),
            StorageEngine::Lsm(store) => store.insert(key, value),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self {
            StorageEngine::Btree(store) => store.get(key),
            StorageEngine::Lsm(store) => store.get(key),
        }
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        match self {
            StorageEngine::Btree(store) => store.delete(key),
            StorageEngine::Lsm(store) => store.delete(key),
        }
    }
}
