//! In-memory sorted table absorbing writes before flush.
//!
//! Backed by `crossbeam-skiplist`'s lock-free skip list: per-level atomic
//! forward pointers, CAS insertion, concurrent reads without blocking
//! writers. Deletes are logical — a `None` value is the tombstone — so a
//! delete shadows older versions in SSTables below without touching them.
//!
//! Size accounting is an atomic byte counter: inserts add key plus value
//! length, tombstones add the key length, and nothing is ever subtracted.
//! Tombstones therefore occupy budget until the next flush, which matches
//! the flush-oriented lifecycle: a memtable only ever grows, gets swapped
//! out whole, and is then dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};

/// A single memtable generation. Active on construction; `seal()` flips it
/// read-only exactly once, right before the coordinator swaps in a fresh
/// table, so writes racing the swap bounce with `ReadOnly` and retry
/// against the new active table.
#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Option<Vec<u8>>>,
    size: AtomicUsize,
    max_size: usize,
    sealed: AtomicBool,
}

impl Memtable {
    /// Creates an empty memtable with the given byte cap.
    pub fn new(max_size: usize) -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            max_size,
            sealed: AtomicBool::new(false),
        }
    }

    /// Inserts or updates a key-value pair. Fails with `MemtableFull` when
    /// the projected size would exceed the cap; landing exactly on the cap
    /// still succeeds.
    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        let entry_size = key.len() + value.len();
        if self.size.load(Ordering::SeqCst) + entry_size > self.max_size {
            return Err(Error::MemtableFull);
        }
        self.data.insert(key, Some(value));
        self.size.fetch_add(entry_size, Ordering::SeqCst);
        Ok(())
    }

    /// Records a tombstone for the key. A delete never bounces off a full
    /// table, but its key still counts toward the cap.
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        let entry_size = key.len();
        self.data.insert(key, None);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
        Ok(())
    }

    /// Marks the table read-only ahead of a swap. Returns `ReadOnly` when
    /// it was already sealed.
    pub fn seal(&self) -> Result<()> {
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Looks up a key. The outer `Option` distinguishes "never seen here"
    /// from a tombstone (`Some(None)`), which the read path must treat as
    /// an authoritative not-found.
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Approximate byte size of the table.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns all live entries in ascending key order, skipping
    /// tombstones.
    pub fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .clone()
                    .map(|value| (entry.key().clone(), value))
            })
            .collect()
    }

    /// Returns every entry in ascending key order, tombstones included.
    /// This is the snapshot a flush turns into an SSTable: the tombstones
    /// must travel with it to keep shadowing older tables.
    pub fn entries(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
