//! Levels of the LSM hierarchy.
//!
//! Each level holds SSTables ordered by minimum key. Level 0 receives raw
//! memtable flushes and may contain overlapping key ranges; compaction
//! establishes the invariant that every deeper level is internally
//! non-overlapping.

use crate::error::Result;

use super::sstable::SsTable;

pub struct Level {
    pub number: u32,
    tables: Vec<SsTable>,
}

impl Level {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            tables: Vec::new(),
        }
    }

    /// Adds a table, keeping the level ordered by minimum key.
    pub fn add(&mut self, table: SsTable) {
        self.tables.push(table);
        self.tables
            .sort_by(|a, b| a.min_key().cmp(b.min_key()).then(a.id().cmp(&b.id())));
    }

    /// Removes and returns every table, emptying the level.
    pub fn take_tables(&mut self) -> Vec<SsTable> {
        std::mem::take(&mut self.tables)
    }

    pub fn tables(&self) -> &[SsTable] {
        &self.tables
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Total data bytes across the level.
    pub fn size(&self) -> u64 {
        self.tables.iter().map(SsTable::size).sum()
    }

    /// Point lookup across the level. Tables are binary-searched by their
    /// min/max range; on level 0 several tables may cover the key, in which
    /// case the newest one wins. Bloom filters short-circuit tables that
    /// definitely lack the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // Only tables whose range starts at or before the key can cover it.
        let end = self.tables.partition_point(|t| t.min_key() <= key);
        let mut candidates: Vec<&SsTable> = self.tables[..end]
            .iter()
            .filter(|table| table.covers(key))
            .collect();
        candidates.sort_by_key(|table| std::cmp::Reverse(table.id()));

        for table in candidates {
            if !table.might_contain(key) {
                continue;
            }
            if let Some(value) = table.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// True if no two tables in the level overlap. Holds for every level
    /// past 0 once compaction has run.
    pub fn is_non_overlapping(&self) -> bool {
        self.tables
            .windows(2)
            .all(|pair| pair[0].max_key() < pair[1].min_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_table(
        dir: &tempfile::TempDir,
        id: u64,
        entries: &[(&[u8], &[u8])],
    ) -> SsTable {
        let path: PathBuf = dir.path().join(format!("db.sst.{id}.sst"));
        let entries: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        SsTable::create(path, id, &entries, false).unwrap()
    }

    #[test]
    fn test_add_keeps_min_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut level = Level::new(0);

        level.add(make_table(&dir, 1, &[(b"m", b"1")]));
        level.add(make_table(&dir, 2, &[(b"a", b"2")]));
        level.add(make_table(&dir, 3, &[(b"t", b"3")]));

        let mins: Vec<&[u8]> = level.tables().iter().map(|t| t.min_key()).collect();
        assert_eq!(mins, vec![b"a".as_slice(), b"m".as_slice(), b"t".as_slice()]);
    }

    #[test]
    fn test_get_routes_to_covering_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut level = Level::new(1);

        level.add(make_table(&dir, 1, &[(b"a", b"1"), (b"d", b"2")]));
        level.add(make_table(&dir, 2, &[(b"m", b"3"), (b"r", b"4")]));

        assert_eq!(level.get(b"d").unwrap(), Some(b"2".to_vec()));
        assert_eq!(level.get(b"m").unwrap(), Some(b"3".to_vec()));
        assert_eq!(level.get(b"g").unwrap(), None, "gap between tables");
        assert_eq!(level.get(b"z").unwrap(), None, "past every range");
    }

    #[test]
    fn test_newest_table_wins_on_level0_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let mut level = Level::new(0);

        level.add(make_table(&dir, 1, &[(b"k", b"old")]));
        level.add(make_table(&dir, 2, &[(b"k", b"new")]));

        assert_eq!(level.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_overlap_detection() {
        let dir = tempfile::tempdir().unwrap();

        let mut disjoint = Level::new(1);
        disjoint.add(make_table(&dir, 1, &[(b"a", b"1"), (b"c", b"2")]));
        disjoint.add(make_table(&dir, 2, &[(b"d", b"3"), (b"f", b"4")]));
        assert!(disjoint.is_non_overlapping());

        let mut overlapping = Level::new(0);
        overlapping.add(make_table(&dir, 3, &[(b"a", b"1"), (b"m", b"2")]));
        overlapping.add(make_table(&dir, 4, &[(b"g", b"3"), (b"z", b"4")]));
        assert!(!overlapping.is_non_overlapping());
    }

    #[test]
    fn test_take_tables_empties_level() {
        let dir = tempfile::tempdir().unwrap();
        let mut level = Level::new(0);
        level.add(make_table(&dir, 1, &[(b"a", b"1")]));

        let taken = level.take_tables();
        assert_eq!(taken.len(), 1);
        assert!(level.is_empty());
        assert_eq!(level.size(), 0);
    }
}
