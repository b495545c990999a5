//! Background compaction under the leveling policy.
//!
//! A worker thread wakes on a timer (or a stop signal) and, once enough
//! level-0 tables accumulate, merges level 0 together with the current
//! level 1 into a single fresh level-1 table. Folding level 1 into every
//! merge keeps that level a single non-overlapping table and means the
//! merge sees all persisted versions of a key, so both shadowed
//! duplicates and tombstones can be dropped outright. Flushes announce
//! new level-0 tables through the lock-free task queue; the worker drains
//! it on every pass, and its length doubles as a "compaction backlog"
//! gauge.
//!
//! The merge is a k-way merge-sort over the input tables' sorted record
//! streams, ordered newest first so the most recent version of each key
//! wins.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::LsmConfig;
use crate::error::{Error, Result};

use super::level::Level;
use super::sstable::{SsTable, SsTableIter};
use super::store::LsmShared;
use super::{next_table_id, sstable_path, TOMBSTONE};

/// Number of level-0 tables that triggers a merge on the timer path.
pub const LEVEL0_COMPACTION_THRESHOLD: usize = 4;

/// Handle to the background compaction thread.
pub struct Compactor {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Compactor {
    /// Spawns the worker loop. It runs one compaction check per
    /// `compaction_interval` until stopped.
    pub fn start(shared: Arc<LsmShared>) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let interval = shared.config.compaction_interval;

        let handle = std::thread::Builder::new()
            .name("emberdb-compactor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = compact(&shared, false) {
                            tracing::error!(error = %e, "background compaction failed");
                        }
                    }
                }
            })
            .map_err(|e| Error::IO(format!("failed to spawn compactor: {e}")))?;

        Ok(Self { stop_tx, handle })
    }

    /// Signals the worker and waits for its in-flight pass to finish.
    pub fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(());
        self.handle
            .join()
            .map_err(|_| Error::IO("compactor thread panicked".to_string()))
    }
}

/// Merges level 0 (plus the existing level 1) into level 1. On the timer
/// path this is a no-op until the level-0 threshold is reached; `force`
/// merges whatever is there.
pub fn compact(shared: &LsmShared, force: bool) -> Result<()> {
    let _guard = shared.compaction_lock.lock()?;

    // Drain flush notifications accumulated since the last pass.
    while shared.tasks.dequeue().is_some() {}

    let mut levels = shared.levels.write()?;
    let count = levels[0].table_count();
    if count == 0 || (!force && count < LEVEL0_COMPACTION_THRESHOLD) {
        return Ok(());
    }

    let mut sources = levels[0].take_tables();
    if let Some(level1) = levels.get_mut(1) {
        sources.extend(level1.take_tables());
    }
    // Newest first: the merge resolves duplicate keys toward lower source
    // indices, which must be the most recent writes. Table ids are
    // creation-ordered, and every level-0 table postdates the level-1
    // table it is merged with.
    sources.sort_by_key(|table| Reverse(table.id()));

    match merge_tables(&shared.config, &sources) {
        Ok(merged) => {
            tracing::info!(
                sources = sources.len(),
                entries = merged.as_ref().map_or(0, SsTable::len),
                "compacted level 0 into level 1"
            );
            while levels.len() < 2 {
                let number = levels.len() as u32;
                levels.push(Level::new(number));
            }
            if let Some(merged) = merged {
                levels[1].add(merged);
            }
            drop(levels);

            for table in sources {
                let path = table.path().to_path_buf();
                if let Err(e) = table.remove() {
                    tracing::warn!(table = %path.display(), error = %e, "failed to delete compacted input");
                }
            }
            Ok(())
        }
        Err(e) => {
            // Put the inputs back so reads keep seeing them.
            for table in sources {
                levels[0].add(table);
            }
            Err(e)
        }
    }
}

/// Builds one merged table from the given inputs, newest first. The merge
/// spans every persisted version of each key, so tombstones have nothing
/// left to shadow and are dropped along with shadowed duplicates. Returns
/// `None` when nothing survives the merge.
fn merge_tables(config: &LsmConfig, sources: &[SsTable]) -> Result<Option<SsTable>> {
    let mut iterators = Vec::with_capacity(sources.len());
    for table in sources {
        iterators.push(table.iter()?);
    }

    let entries: Vec<(Vec<u8>, Vec<u8>)> = MergeIterator::new(iterators)
        .filter(|entry| !matches!(entry, Ok((_, value)) if value == TOMBSTONE))
        .collect::<Result<_>>()?;
    if entries.is_empty() {
        return Ok(None);
    }

    let id = next_table_id();
    SsTable::create(
        sstable_path(&config.dir, id),
        id,
        &entries,
        config.use_bloom_filter,
    )
    .map(Some)
}

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed on both fields: BinaryHeap is a max-heap, we want the
        // smallest key first and, on ties, the lowest (newest) source.
        match self.key.cmp(&other.key) {
            CmpOrdering::Equal => other.source.cmp(&self.source),
            ordering => ordering.reverse(),
        }
    }
}

/// K-way merge over sorted record streams with duplicate elimination: of
/// equal keys, only the entry from the lowest source index is yielded.
pub struct MergeIterator {
    iterators: Vec<SsTableIter>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
}

impl MergeIterator {
    pub fn new(mut iterators: Vec<SsTableIter>) -> Self {
        let mut heap = BinaryHeap::new();
        for (source, iterator) in iterators.iter_mut().enumerate() {
            if let Some(Ok((key, value))) = iterator.next() {
                heap.push(HeapEntry { key, value, source });
            }
        }
        Self {
            iterators,
            heap,
            last_key: None,
        }
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        match self.iterators[source].next() {
            Some(Ok((key, value))) => {
                self.heap.push(HeapEntry { key, value, source });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.heap.pop() {
            if let Err(e) = self.advance(entry.source) {
                return Some(Err(e));
            }

            // A key equal to the last yielded one comes from an older
            // source; it is shadowed and dropped.
            if self.last_key.as_ref() == Some(&entry.key) {
                continue;
            }

            self.last_key = Some(entry.key.clone());
            return Some(Ok((entry.key, entry.value)));
        }
        None
    }
}
