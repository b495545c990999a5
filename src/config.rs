use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errinput;
use crate::error::Result;

/// Default minimum degree `t` for the B-tree backend.
pub const DEFAULT_DEGREE: usize = 32;
/// Default page size in bytes for the B-tree backend.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Configuration for the paged B-tree backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BtreeConfig {
    /// Minimum degree `t`: every non-root node holds between `t-1` and
    /// `2t-1` items (default: 32).
    pub degree: usize,

    /// Page size in bytes. Every node occupies exactly one page (default: 4096).
    pub page_size: usize,

    /// Advisory flag carried for configuration compatibility; the engine is
    /// always internally synchronized.
    pub thread_safe: bool,

    /// Maximum number of decoded nodes to keep in the LRU cache
    /// (0 disables caching).
    pub cache_size: usize,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            degree: DEFAULT_DEGREE,
            page_size: DEFAULT_PAGE_SIZE,
            thread_safe: true,
            cache_size: 1024,
        }
    }
}

impl BtreeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum degree.
    pub fn degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    /// Set the page size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set thread safety (advisory).
    pub fn thread_safe(mut self, enabled: bool) -> Self {
        self.thread_safe = enabled;
        self
    }

    /// Set the node cache capacity.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.degree < 2 {
            return errinput!("degree must be at least 2, got {}", self.degree);
        }
        if self.page_size < 512 {
            return errinput!("page size must be at least 512, got {}", self.page_size);
        }
        Ok(())
    }
}

/// Compaction strategy for the LSM backend. Only leveling is implemented;
/// sizing is accepted by validation and reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionStrategy {
    Leveling,
    Sizing,
}

/// SSTable compression. Accepted by validation and reserved; the core never
/// compresses record bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Snappy,
    Zstd,
}

/// Behavior when recovery encounters a corrupt SSTable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// Fail the open with `Error::Corrupted`.
    Strict,
    /// Skip the corrupt table with a warning and keep opening.
    BestEffort,
}

/// Configuration for the LSM backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LsmConfig {
    /// Data directory root.
    pub dir: PathBuf,

    /// Advisory flag carried for configuration compatibility; the engine is
    /// always internally synchronized.
    pub thread_safe: bool,

    /// Byte cap on the active memtable before a flush is triggered
    /// (default: 16MB).
    pub memtable_size: usize,

    /// Advisory target size for SSTable files (default: 2MB).
    pub sstable_size: usize,

    /// Interval between background compaction checks (default: 10s).
    pub compaction_interval: Duration,

    /// Block cache budget in bytes; the entry count is approximated as
    /// `cache_size / 64` (default: 100MB).
    pub cache_size: usize,

    /// Build a bloom filter for each SSTable.
    pub use_bloom_filter: bool,

    /// Compaction strategy (default: leveling).
    pub compaction_strategy: CompactionStrategy,

    /// SSTable compression (default: none; reserved).
    pub compression_type: CompressionType,

    /// Fsync the WAL after every record.
    pub sync_writes: bool,

    /// Maximum number of simultaneously open SSTable files (validated only).
    pub max_open_files: usize,

    /// Recovery behavior for corrupt SSTables (default: strict).
    pub recovery_mode: RecoveryMode,

    /// Logging verbosity hint: "debug", "info", "warn", or "error"
    /// (validated only; the library never installs a subscriber).
    pub log_level: String,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            thread_safe: true,
            memtable_size: 16 * 1024 * 1024,
            sstable_size: 2 * 1024 * 1024,
            compaction_interval: Duration::from_secs(10),
            cache_size: 100 * 1024 * 1024,
            use_bloom_filter: true,
            compaction_strategy: CompactionStrategy::Leveling,
            compression_type: CompressionType::None,
            sync_writes: false,
            max_open_files: 1000,
            recovery_mode: RecoveryMode::Strict,
            log_level: "info".to_string(),
        }
    }
}

impl LsmConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable byte cap.
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the advisory SSTable target size.
    pub fn sstable_size(mut self, size: usize) -> Self {
        self.sstable_size = size;
        self
    }

    /// Set the compaction check interval.
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set the block cache byte budget.
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Enable or disable per-SSTable bloom filters.
    pub fn use_bloom_filter(mut self, enabled: bool) -> Self {
        self.use_bloom_filter = enabled;
        self
    }

    /// Set the compaction strategy.
    pub fn compaction_strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.compaction_strategy = strategy;
        self
    }

    /// Set the compression type.
    pub fn compression_type(mut self, compression: CompressionType) -> Self {
        self.compression_type = compression;
        self
    }

    /// Fsync the WAL after every record.
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Set the recovery mode.
    pub fn recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.recovery_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return errinput!("data directory path is required");
        }
        if self.memtable_size == 0 {
            return errinput!("memtable_size must be positive");
        }
        if self.sstable_size == 0 {
            return errinput!("sstable_size must be positive");
        }
        if self.compaction_interval.is_zero() {
            return errinput!("compaction_interval must be positive");
        }
        if self.max_open_files == 0 {
            return errinput!("max_open_files must be positive");
        }
        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => return errinput!("log_level must be debug, info, warn or error, got {other}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btree_defaults() {
        let config = BtreeConfig::default();
        assert_eq!(config.degree, 32);
        assert_eq!(config.page_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_btree_validation() {
        assert!(BtreeConfig::new().degree(1).validate().is_err());
        assert!(BtreeConfig::new().page_size(64).validate().is_err());
        assert!(BtreeConfig::new().degree(2).page_size(512).validate().is_ok());
    }

    #[test]
    fn test_lsm_defaults() {
        let config = LsmConfig::default();
        assert_eq!(config.memtable_size, 16 * 1024 * 1024);
        assert_eq!(config.cache_size, 100 * 1024 * 1024);
        assert_eq!(config.compaction_interval, Duration::from_secs(10));
        assert_eq!(config.compaction_strategy, CompactionStrategy::Leveling);
        assert_eq!(config.recovery_mode, RecoveryMode::Strict);
        assert!(!config.sync_writes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lsm_builder() {
        let config = LsmConfig::new("/tmp/test")
            .memtable_size(1024)
            .compaction_interval(Duration::from_secs(5))
            .use_bloom_filter(false)
            .sync_writes(true);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.memtable_size, 1024);
        assert_eq!(config.compaction_interval, Duration::from_secs(5));
        assert!(!config.use_bloom_filter);
        assert!(config.sync_writes);
    }

    #[test]
    fn test_lsm_validation() {
        assert!(LsmConfig::new("").validate().is_err());
        assert!(LsmConfig::new("/tmp/x").memtable_size(0).validate().is_err());

        let mut config = LsmConfig::new("/tmp/x");
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }
}
