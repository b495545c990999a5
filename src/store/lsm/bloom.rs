//! Bloom filter for SSTable point lookups.
//!
//! A fixed-size bit array probed at two positions per key. Both positions
//! come from a single FNV-1a pass: the low word and the word shifted right
//! by 16 bits, each reduced modulo the filter size. No false negatives;
//! false positives cost one wasted index probe.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Bits allocated per expected key when sizing a filter.
const BITS_PER_KEY: usize = 10;

pub struct BloomFilter {
    bits: Vec<u64>,
    size: usize,
}

impl BloomFilter {
    /// Creates a filter with the given number of bits.
    pub fn new(size: usize) -> Self {
        let size = size.max(64);
        Self {
            bits: vec![0u64; size.div_ceil(64)],
            size,
        }
    }

    /// Creates a filter sized for the expected number of keys.
    pub fn with_capacity(expected_keys: usize) -> Self {
        Self::new(expected_keys.max(1) * BITS_PER_KEY)
    }

    /// Inserts the key into the filter.
    pub fn add(&mut self, key: &[u8]) {
        for index in self.positions(key) {
            self.bits[index / 64] |= 1 << (index % 64);
        }
    }

    /// Returns false only when the key is definitely absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.positions(key)
            .iter()
            .all(|&index| self.bits[index / 64] & (1 << (index % 64)) != 0)
    }

    fn positions(&self, key: &[u8]) -> [usize; 2] {
        let hash = fnv1a(key);
        [
            hash as usize % self.size,
            (hash >> 16) as usize % self.size,
        ]
    }
}

fn fnv1a(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
