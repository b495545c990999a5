//! LSM-tree storage backend.
//!
//! Writes land in the write-ahead log and the in-memory memtable; full
//! memtables flush into immutable level-0 SSTables, and a background
//! compactor merges level 0 into level 1:
//!
//! ```text
//!  writes ──► WAL ──► Active Memtable
//!                          │ flush
//!                          ▼
//!                  ┌──────────────┐
//!                  │   Level 0    │  overlapping ranges
//!                  └──────────────┘
//!                          │ compaction (merge-sort, dedup)
//!                          ▼
//!                  ┌──────────────┐
//!                  │   Level 1    │  non-overlapping ranges
//!                  └──────────────┘
//! ```
//!
//! Reads check the memtable, then the block cache, then each level in
//! order. Crash recovery reloads every SSTable and replays the WAL.

pub mod bloom;
pub mod compaction;
pub mod level;
pub mod memtable;
pub mod metrics;
pub mod recovery;
pub mod sstable;
pub mod store;
pub mod wal;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub use level::Level;
pub use memtable::Memtable;
pub use sstable::SsTable;
pub use store::LsmStore;
pub use wal::{Wal, WalEntry};

/// Write-ahead log file name within the data directory.
pub const WAL_FILE: &str = "db.wal";
/// Lock file guarding the data directory against double-open.
pub const LOCK_FILE: &str = "emberdb.lock";

/// Sentinel value marking a deleted key in SSTables. Flushed tombstones
/// must shadow older values in deeper tables, and the record format has no
/// flag bit, so deletion rides in the value itself. Compaction strips the
/// sentinel once nothing older remains underneath.
pub const TOMBSTONE: &[u8] = b"<TOMBSTONE>";

/// Last id handed out, so two tables created in the same nanosecond still
/// get distinct, monotonic ids.
static LAST_TABLE_ID: AtomicU64 = AtomicU64::new(0);

/// Returns a new creation-ordered table id based on the wall clock.
pub(crate) fn next_table_id() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut last = LAST_TABLE_ID.load(Ordering::SeqCst);
    loop {
        let id = now.max(last + 1);
        match LAST_TABLE_ID.compare_exchange(last, id, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return id,
            Err(current) => last = current,
        }
    }
}

/// Path of the SSTable with the given id inside the data directory.
pub(crate) fn sstable_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("db.sst.{id}.sst"))
}
