//! The LSM coordinator: routes writes through the WAL and memtable, reads
//! across the memtable, block cache and level set, and drives flushes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::cache::Cache;
use crate::config::LsmConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::lockfree::LfQueue;
use crate::store::Storage;

use super::compaction::{self, Compactor};
use super::level::Level;
use super::memtable::Memtable;
use super::metrics::Metrics;
use super::recovery;
use super::sstable::SsTable;
use super::wal::{Wal, WalEntry};
use super::{next_table_id, sstable_path, LOCK_FILE, TOMBSTONE, WAL_FILE};

/// Approximate bytes per block cache entry, used to turn the configured
/// byte budget into an entry count.
const CACHE_ENTRY_ESTIMATE: usize = 64;

/// State shared between the coordinator and the compaction worker.
pub struct LsmShared {
    pub(super) config: LsmConfig,
    /// The active memtable. The coordinator is the only writer of this
    /// slot; mutators clone the `Arc` and operate on the pointee.
    pub(super) memtable: RwLock<Arc<Memtable>>,
    pub(super) levels: RwLock<Vec<Level>>,
    pub(super) wal: Wal,
    pub(super) cache: Mutex<Cache<Vec<u8>, Vec<u8>>>,
    pub(super) metrics: Metrics,
    /// Serializes flushes so only one memtable swap is in flight.
    pub(super) flush_lock: Mutex<()>,
    /// Serializes compaction passes.
    pub(super) compaction_lock: Mutex<()>,
    /// Flush-to-compactor handoff: ids of freshly written level-0 tables.
    pub(super) tasks: LfQueue<u64>,
}

/// LSM-tree storage backend.
pub struct LsmStore {
    shared: Arc<LsmShared>,
    compactor: Mutex<Option<Compactor>>,
    closed: AtomicBool,
    _lock: FileLock,
}

impl LsmStore {
    /// Opens a store in the configured directory, recovering any previous
    /// state, and starts the background compactor.
    pub fn open(config: LsmConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE))
            .map_err(|e| Error::IO(format!("failed to lock {}: {e}", config.dir.display())))?;

        let levels = recovery::load_levels(&config)?;

        let wal_path = config.dir.join(WAL_FILE);
        let memtable = Memtable::new(config.memtable_size);
        recovery::replay_wal(&wal_path, &memtable)?;
        let wal = Wal::open(&wal_path, config.sync_writes)?;

        let cache_entries = config.cache_size / CACHE_ENTRY_ESTIMATE;
        let shared = Arc::new(LsmShared {
            memtable: RwLock::new(Arc::new(memtable)),
            levels: RwLock::new(levels),
            wal,
            cache: Mutex::new(Cache::new(cache_entries)),
            metrics: Metrics::new(),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            tasks: LfQueue::new(),
            config,
        });

        let compactor = Compactor::start(Arc::clone(&shared))?;

        tracing::info!(dir = %shared.config.dir.display(), "opened lsm store");
        Ok(Self {
            shared,
            compactor: Mutex::new(Some(compactor)),
            closed: AtomicBool::new(false),
            _lock: lock,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("store is closed".to_string()));
        }
        Ok(())
    }

    fn do_insert(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.ensure_open()?;

        self.shared.wal.append(WalEntry::Insert {
            key: key.to_vec(),
            value: value.clone(),
        })?;

        let mut flushed = false;
        loop {
            let memtable = Arc::clone(&*self.shared.memtable.read()?);
            match memtable.insert(key.to_vec(), value.clone()) {
                Ok(()) => break,
                // The table was swapped out under us; retry on the new one.
                Err(Error::ReadOnly) => continue,
                Err(Error::MemtableFull) if !flushed => {
                    self.flush()?;
                    flushed = true;
                }
                Err(e) => return Err(e),
            }
        }

        // A mutated key must not be served from a stale cache entry.
        self.shared.cache.lock()?.remove(&key.to_vec());
        self.shared.metrics.inc_writes();
        Ok(())
    }

    fn do_get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        match self.lookup(key)? {
            Some(value) => Ok(value),
            None => Err(Error::KeyNotFound),
        }
    }

    /// The layered read path: memtable, then block cache, then the level
    /// set. The memtable comes first so its tombstones can never be masked
    /// by a cached pre-delete value. Every successful lookup counts as a
    /// read; `cache_hits` counts block-cache hits only.
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let memtable = Arc::clone(&*self.shared.memtable.read()?);
        match memtable.get(key) {
            Some(Some(value)) => {
                self.shared.metrics.inc_reads();
                return Ok(Some(value));
            }
            // Tombstone: the key is authoritatively gone.
            Some(None) => return Ok(None),
            None => {}
        }

        if let Some(value) = self.shared.cache.lock()?.get(&key.to_vec()) {
            self.shared.metrics.inc_reads();
            self.shared.metrics.inc_cache_hits();
            return Ok(Some(value));
        }

        let levels = self.shared.levels.read()?;
        for level in levels.iter() {
            if let Some(value) = level.get(key)? {
                // A flushed tombstone shadows anything deeper.
                if value == TOMBSTONE {
                    return Ok(None);
                }
                self.shared
                    .cache
                    .lock()?
                    .insert(key.to_vec(), value.clone());
                self.shared.metrics.inc_reads();
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    fn do_delete(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;

        // Deleting an absent key reports not-found instead of recording a
        // pointless tombstone.
        if self.lookup(key)?.is_none() {
            return Err(Error::KeyNotFound);
        }

        self.shared
            .wal
            .append(WalEntry::Delete { key: key.to_vec() })?;

        loop {
            let memtable = Arc::clone(&*self.shared.memtable.read()?);
            match memtable.delete(key.to_vec()) {
                Ok(()) => break,
                Err(Error::ReadOnly) => continue,
                Err(e) => return Err(e),
            }
        }

        self.shared.cache.lock()?.remove(&key.to_vec());
        self.shared.metrics.inc_writes();
        Ok(())
    }

    /// Flushes the active memtable into a level-0 SSTable. Safe to call
    /// when empty; concurrent callers serialize on the flush lock and the
    /// losers find an empty table.
    pub fn flush(&self) -> Result<()> {
        let _flush_guard = self.shared.flush_lock.lock()?;

        // The level vector is locked for the whole build so a reader that
        // already missed the (new, empty) memtable blocks here until the
        // flushed table is visible.
        let mut levels = self.shared.levels.write()?;

        let snapshot = {
            let mut active = self.shared.memtable.write()?;
            if active.size() == 0 {
                return Ok(());
            }
            active.seal()?;
            std::mem::replace(
                &mut *active,
                Arc::new(Memtable::new(self.shared.config.memtable_size)),
            )
        };

        // Tombstones flush too, as sentinel-valued records: they must keep
        // shadowing the key in older tables below.
        let entries: Vec<(Vec<u8>, Vec<u8>)> = snapshot
            .entries()
            .into_iter()
            .map(|(key, value)| (key, value.unwrap_or_else(|| TOMBSTONE.to_vec())))
            .collect();
        if !entries.is_empty() {
            let id = next_table_id();
            let table = SsTable::create(
                sstable_path(&self.shared.config.dir, id),
                id,
                &entries,
                self.shared.config.use_bloom_filter,
            )?;
            tracing::info!(table_id = id, entries = table.len(), "flushed memtable");
            levels[0].add(table);
            self.shared.tasks.enqueue(id);
        }
        drop(levels);

        // The flushed state is durable in the table now; the log restarts
        // from empty for the new memtable.
        self.shared.wal.flush()?;
        self.shared.wal.reset()?;
        Ok(())
    }

    /// Flushes any buffered writes and merges level 0 immediately,
    /// regardless of the compaction threshold.
    pub fn force_compaction(&self) -> Result<()> {
        self.ensure_open()?;

        if self.shared.memtable.read()?.size() > 0 {
            self.flush()?;
        }
        compaction::compact(&self.shared, true)
    }

    /// Current statistics as a key-value map.
    pub fn stats(&self) -> BTreeMap<String, u64> {
        let mut stats = BTreeMap::new();

        if let Ok(memtable) = self.shared.memtable.read() {
            stats.insert("memtable_size".to_string(), memtable.size() as u64);
            stats.insert("memtable_entries".to_string(), memtable.len() as u64);
        }

        if let Ok(levels) = self.shared.levels.read() {
            stats.insert("levels".to_string(), levels.len() as u64);
            let total: usize = levels.iter().map(Level::table_count).sum();
            stats.insert("sstable_count".to_string(), total as u64);
            for level in levels.iter() {
                stats.insert(
                    format!("level{}_tables", level.number),
                    level.table_count() as u64,
                );
            }
        }

        let metrics = self.shared.metrics.snapshot();
        stats.insert("writes".to_string(), metrics.writes);
        stats.insert("reads".to_string(), metrics.reads);
        stats.insert("cache_hits".to_string(), metrics.cache_hits);
        stats.insert("wal_pending".to_string(), self.shared.wal.pending());
        stats.insert(
            "pending_compactions".to_string(),
            self.shared.tasks.len() as u64,
        );
        stats
    }

    /// Stops the compactor, flushes buffered writes and closes the WAL.
    /// Idempotent; every operation after close fails with `InvalidState`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(compactor) = self.compactor.lock()?.take() {
            compactor.stop()?;
        }
        self.flush()?;
        self.shared.wal.close()?;

        tracing::info!(dir = %self.shared.config.dir.display(), "closed lsm store");
        Ok(())
    }

    /// The store's data directory.
    pub fn dir(&self) -> PathBuf {
        self.shared.config.dir.clone()
    }

    #[cfg(test)]
    pub(crate) fn level_table_counts(&self) -> Vec<usize> {
        self.shared
            .levels
            .read()
            .unwrap()
            .iter()
            .map(Level::table_count)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn assert_levels_sound(&self) {
        let levels = self.shared.levels.read().unwrap();
        for level in levels.iter().skip(1) {
            assert!(
                level.is_non_overlapping(),
                "level {} has overlapping tables",
                level.number
            );
        }
    }
}

impl Storage for LsmStore {
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.do_insert(key, value)
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.do_get(key)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.do_delete(key)
    }
}

impl Drop for LsmStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close lsm store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> LsmConfig {
        LsmConfig::new(dir.path())
            // Long enough that tests control compaction explicitly.
            .compaction_interval(Duration::from_secs(3600))
    }

    fn open_store(dir: &tempfile::TempDir) -> LsmStore {
        LsmStore::open(test_config(dir)).expect("Failed to open store")
    }

    #[test]
    fn test_insert_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.insert(b"alpha", b"1".to_vec()).unwrap();
        store.insert(b"beta", b"2".to_vec()).unwrap();
        store.insert(b"gamma", b"3".to_vec()).unwrap();

        assert_eq!(store.get(b"beta").unwrap(), b"2");

        store.delete(b"beta").unwrap();
        assert_eq!(store.get(b"beta"), Err(Error::KeyNotFound));
        assert_eq!(store.delete(b"beta"), Err(Error::KeyNotFound));
        assert_eq!(store.get(b"alpha").unwrap(), b"1");
    }

    #[test]
    fn test_update_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.insert(b"key", b"old".to_vec()).unwrap();
        store.insert(b"key", b"new".to_vec()).unwrap();
        assert_eq!(store.get(b"key").unwrap(), b"new");
    }

    #[test]
    fn test_flush_keeps_data_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for i in 0..20 {
            let key = format!("key_{i:02}");
            store.insert(key.as_bytes(), format!("value_{i}").into_bytes()).unwrap();
        }
        store.flush().unwrap();

        assert_eq!(store.level_table_counts()[0], 1);
        for i in 0..20 {
            let key = format!("key_{i:02}");
            assert_eq!(store.get(key.as_bytes()).unwrap(), format!("value_{i}").into_bytes());
        }
    }

    #[test]
    fn test_memtable_full_triggers_flush_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir).memtable_size(64);
        let store = LsmStore::open(config).unwrap();

        // Far more data than one 64-byte memtable holds.
        for i in 0..20 {
            let key = format!("key_{i:02}");
            store.insert(key.as_bytes(), b"0123456789".to_vec()).unwrap();
        }

        let counts = store.level_table_counts();
        assert!(counts[0] >= 1, "flushes must have produced level-0 tables");

        for i in 0..20 {
            let key = format!("key_{i:02}");
            assert_eq!(store.get(key.as_bytes()).unwrap(), b"0123456789");
        }
    }

    #[test]
    fn test_delete_after_flush_is_not_masked() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.insert(b"key", b"value".to_vec()).unwrap();
        store.flush().unwrap();

        // Warm the block cache with the flushed value.
        assert_eq!(store.get(b"key").unwrap(), b"value");

        store.delete(b"key").unwrap();
        assert_eq!(store.get(b"key"), Err(Error::KeyNotFound));
    }

    #[test]
    fn test_force_compaction_merges_to_single_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for batch in 0..3 {
            for i in 0..5 {
                let key = format!("key_{batch}_{i}");
                store.insert(key.as_bytes(), b"v".to_vec()).unwrap();
            }
            store.flush().unwrap();
        }
        assert_eq!(store.level_table_counts()[0], 3);

        store.force_compaction().unwrap();

        let counts = store.level_table_counts();
        assert_eq!(counts[0], 0);
        assert_eq!(counts[1], 1);
        store.assert_levels_sound();

        for batch in 0..3 {
            for i in 0..5 {
                let key = format!("key_{batch}_{i}");
                assert_eq!(store.get(key.as_bytes()).unwrap(), b"v");
            }
        }

        // Compacted inputs are gone from disk: one sstable file remains.
        let sst_files = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("sst")
            })
            .count();
        assert_eq!(sst_files, 1);
    }

    #[test]
    fn test_delete_survives_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = open_store(&dir);
            store.insert(b"key", b"value".to_vec()).unwrap();
            store.flush().unwrap();
            store.delete(b"key").unwrap();
            store.close().unwrap();
        }

        // The value sits in an older sstable; the flushed tombstone must
        // keep shadowing it after recovery.
        let store = open_store(&dir);
        assert_eq!(store.get(b"key"), Err(Error::KeyNotFound));
    }

    #[test]
    fn test_tombstone_resolved_by_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.insert(b"keep", b"1".to_vec()).unwrap();
        store.insert(b"drop", b"2".to_vec()).unwrap();
        store.flush().unwrap();
        store.delete(b"drop").unwrap();

        store.force_compaction().unwrap();

        assert_eq!(store.get(b"drop"), Err(Error::KeyNotFound));
        assert_eq!(store.get(b"keep").unwrap(), b"1");

        // The merge spanned every version, so the deleted key is gone from
        // the level system entirely, not carried as a tombstone.
        let counts = store.level_table_counts();
        assert_eq!(counts[0], 0);
        assert_eq!(counts[1], 1);
    }

    #[test]
    fn test_repeated_compaction_keeps_single_level1_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        for round in 0..3 {
            store
                .insert(format!("key{round}").as_bytes(), b"v".to_vec())
                .unwrap();
            store.flush().unwrap();
            store.force_compaction().unwrap();

            let counts = store.level_table_counts();
            assert_eq!(counts[0], 0);
            assert_eq!(counts[1], 1);
            store.assert_levels_sound();
        }

        for round in 0..3 {
            assert_eq!(store.get(format!("key{round}").as_bytes()).unwrap(), b"v");
        }
    }

    #[test]
    fn test_compaction_applies_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.insert(b"key", b"old".to_vec()).unwrap();
        store.flush().unwrap();
        store.insert(b"key", b"new".to_vec()).unwrap();
        store.flush().unwrap();

        store.force_compaction().unwrap();
        assert_eq!(store.get(b"key").unwrap(), b"new");
    }

    #[test]
    fn test_recovery_from_wal() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = open_store(&dir);
            store.insert(b"delta", b"4".to_vec()).unwrap();
            store.insert(b"epsilon", b"5".to_vec()).unwrap();
            store.delete(b"delta").unwrap();
            // Dropped without an explicit flush; close() flushes, and the
            // WAL covered everything before that anyway.
        }

        let store = open_store(&dir);
        assert_eq!(store.get(b"delta"), Err(Error::KeyNotFound));
        assert_eq!(store.get(b"epsilon").unwrap(), b"5");
    }

    #[test]
    fn test_recovery_from_sstables_and_wal_together() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = open_store(&dir);
            store.insert(b"flushed", b"1".to_vec()).unwrap();
            store.flush().unwrap();
            store.insert(b"logged", b"2".to_vec()).unwrap();
        }

        let store = open_store(&dir);
        assert_eq!(store.get(b"flushed").unwrap(), b"1");
        assert_eq!(store.get(b"logged").unwrap(), b"2");
    }

    #[test]
    fn test_operations_after_close_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.insert(b"key", b"value".to_vec()).unwrap();
        store.close().unwrap();

        assert!(matches!(
            store.insert(b"key2", b"v".to_vec()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(store.get(b"key"), Err(Error::InvalidState(_))));
        // Closing again is a no-op.
        store.close().unwrap();
    }

    #[test]
    fn test_directory_is_exclusively_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        assert!(LsmStore::open(test_config(&dir)).is_err());

        store.close().unwrap();
        drop(store);
        let _reopened = open_store(&dir);
    }

    #[test]
    fn test_stats_reflect_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.insert(b"a", b"1".to_vec()).unwrap();
        store.insert(b"b", b"2".to_vec()).unwrap();
        store.get(b"a").unwrap();

        let stats = store.stats();
        assert_eq!(stats["writes"], 2);
        assert!(stats["memtable_size"] > 0);
        assert_eq!(stats["sstable_count"], 0);
        // A memtable hit is a read, not a block-cache hit.
        assert_eq!(stats["reads"], 1);
        assert_eq!(stats["cache_hits"], 0);

        store.flush().unwrap();
        let stats = store.stats();
        assert_eq!(stats["memtable_size"], 0);
        assert_eq!(stats["sstable_count"], 1);
        assert_eq!(stats["pending_compactions"], 1);

        // First post-flush read comes from the level set and warms the
        // block cache; the repeat is the only block-cache hit.
        store.get(b"a").unwrap();
        store.get(b"a").unwrap();
        let stats = store.stats();
        assert_eq!(stats["reads"], 3);
        assert_eq!(stats["cache_hits"], 1);
    }

    #[test]
    fn test_timer_driven_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = LsmConfig::new(dir.path()).compaction_interval(Duration::from_millis(50));
        let store = LsmStore::open(config).unwrap();

        for batch in 0..4 {
            for i in 0..5 {
                let key = format!("key_{batch}_{i}");
                store.insert(key.as_bytes(), b"v".to_vec()).unwrap();
            }
            store.flush().unwrap();
        }

        // Four level-0 tables reach the threshold; the background worker
        // should merge them within a few ticks.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let counts = store.level_table_counts();
            if counts[0] == 0 && counts.get(1) == Some(&1) {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "compaction did not run, level counts: {counts:?}"
            );
            std::thread::sleep(Duration::from_millis(20));
        }

        for batch in 0..4 {
            for i in 0..5 {
                let key = format!("key_{batch}_{i}");
                assert_eq!(store.get(key.as_bytes()).unwrap(), b"v");
            }
        }
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open_store(&dir));

        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("key_{t}_{i:03}");
                    store.insert(key.as_bytes(), key.clone().into_bytes()).unwrap();
                    assert_eq!(store.get(key.as_bytes()).unwrap(), key.as_bytes());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..4 {
            for i in 0..100 {
                let key = format!("key_{t}_{i:03}");
                assert_eq!(store.get(key.as_bytes()).unwrap(), key.as_bytes());
            }
        }
    }
}
