//! Operation counters for the LSM store.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters updated on the hot paths. All loads and stores are
/// relaxed-free `SeqCst` for simplicity; these are metrics, not
/// synchronization.
#[derive(Debug, Default)]
pub struct Metrics {
    writes: AtomicU64,
    reads: AtomicU64,
    cache_hits: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub writes: u64,
    pub reads: u64,
    pub cache_hits: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_writes(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn inc_reads(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes: self.writes.load(Ordering::SeqCst),
            reads: self.reads.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();

        metrics.inc_writes();
        metrics.inc_writes();
        metrics.inc_reads();
        metrics.inc_cache_hits();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.writes, 2);
        assert_eq!(snapshot.reads, 1);
        assert_eq!(snapshot.cache_hits, 1);
    }
}
