use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A bounded LRU cache.
///
/// Recency is tracked with a monotonic use counter: every access stamps the
/// entry with the next counter value, and a `BTreeMap` from stamp to key
/// yields the least recently used entry in O(log n). This avoids intrusive
/// linked lists while keeping promote and evict cheap.
///
/// The cache itself is not synchronized; callers wrap it in the lock that
/// matches their access pattern (the B-tree node cache uses an `RwLock`
/// separate from the tree lock, the LSM block cache a `Mutex`).
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
    /// Use-stamp to key, ordered oldest first.
    order: BTreeMap<u64, K>,
    clock: u64,
    stats: Stats,
}

struct Entry<V> {
    value: V,
    stamp: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    /// Creates a cache holding at most `capacity` entries. A capacity of 0
    /// disables the cache: every insert is dropped and every get misses.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
            stats: Stats::new(),
        }
    }

    /// Returns a clone of the cached value and promotes the entry.
    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get_mut(key) {
            let stamp = self.clock;
            self.clock += 1;
            self.order.remove(&entry.stamp);
            entry.stamp = stamp;
            self.order.insert(stamp, key.clone());
            self.stats.hit();
            Some(entry.value.clone())
        } else {
            self.stats.miss();
            None
        }
    }

    /// Inserts or refreshes an entry, evicting the least recently used entry
    /// if the cache is over capacity.
    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        let stamp = self.clock;
        self.clock += 1;

        if let Some(entry) = self.entries.get_mut(&key) {
            self.order.remove(&entry.stamp);
            entry.value = value;
            entry.stamp = stamp;
            self.order.insert(stamp, key);
            return;
        }

        self.entries.insert(key.clone(), Entry { value, stamp });
        self.order.insert(stamp, key);

        if self.entries.len() > self.capacity {
            self.evict();
        }
    }

    /// Removes an entry without touching recency stats.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        Some(entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns (hits, misses).
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn evict(&mut self) {
        if let Some((&stamp, _)) = self.order.iter().next() {
            if let Some(key) = self.order.remove(&stamp) {
                self.entries.remove(&key);
            }
        }
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}
