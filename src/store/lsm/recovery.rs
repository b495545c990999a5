//! Open-time recovery for the LSM store.
//!
//! Startup state is reconstructed from two sources: every `*.sst` file in
//! the data directory is reloaded into level 0, and the write-ahead log is
//! replayed into a fresh memtable. Anything the previous process flushed
//! survives in tables; anything it only acknowledged survives in the log.

use std::path::Path;

use crate::config::{LsmConfig, RecoveryMode};
use crate::error::{Error, Result};

use super::level::Level;
use super::memtable::Memtable;
use super::sstable::SsTable;
use super::wal::{Wal, WalEntry};

/// Loads every SSTable in the data directory into level 0, sorted by
/// minimum key. Under strict recovery a corrupt table fails the open;
/// under best-effort it is skipped with a warning.
pub fn load_levels(config: &LsmConfig) -> Result<Vec<Level>> {
    let mut level0 = Level::new(0);

    for entry in std::fs::read_dir(&config.dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sst") {
            continue;
        }

        match SsTable::open(&path, config.use_bloom_filter) {
            Ok(table) => {
                tracing::debug!(
                    table = %path.display(),
                    entries = table.len(),
                    "loaded sstable"
                );
                level0.add(table);
            }
            Err(Error::Corrupted(msg)) => match config.recovery_mode {
                RecoveryMode::Strict => return Err(Error::Corrupted(msg)),
                RecoveryMode::BestEffort => {
                    tracing::warn!(
                        table = %path.display(),
                        reason = %msg,
                        "skipping corrupt sstable"
                    );
                }
            },
            Err(e) => return Err(e),
        }
    }

    tracing::info!(tables = level0.table_count(), "recovered level 0");
    Ok(vec![level0])
}

/// Replays the WAL into the given memtable. A missing log file means a
/// clean previous shutdown. Returns the number of records applied.
pub fn replay_wal(path: &Path, memtable: &Memtable) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let mut applied = 0u64;
    for entry in Wal::replay(path)? {
        match entry? {
            WalEntry::Insert { key, value } => {
                if let Err(e) = memtable.insert(key, value) {
                    // The log only ever holds what an earlier memtable
                    // accepted; hitting the cap here means the cap shrank
                    // between runs. Keep the records that fit.
                    tracing::warn!(error = %e, "dropping wal record during replay");
                    continue;
                }
            }
            WalEntry::Delete { key } => {
                memtable.delete(key)?;
            }
        }
        applied += 1;
    }

    tracing::info!(records = applied, "replayed write-ahead log");
    Ok(applied)
}
