//! Immutable sorted string tables.
//!
//! An SSTable is a flat file of key-value records in ascending key order
//! with a trailing checksum:
//!
//! ```text
//! +--------------+-----+--------------+-------+ ... +----------------+
//! | key len: u16 | key | val len: u16 | value |     | crc32: u32 BE  |
//! +--------------+-----+--------------+-------+ ... +----------------+
//! ```
//!
//! Lengths are big-endian; the CRC32 (IEEE polynomial) covers every record
//! byte. The in-memory handle keeps a full key-to-offset index, the key
//! range, and an optional bloom filter; record bodies stay on disk and are
//! read on demand.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::errcorrupt;
use crate::error::{Error, Result};

use super::bloom::BloomFilter;

/// CRC32 with the IEEE polynomial, as used for the file trailer.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const TRAILER_SIZE: u64 = 4;

/// An immutable on-disk sorted table.
pub struct SsTable {
    path: PathBuf,
    /// Creation-ordered id (the timestamp component of the file name);
    /// larger means newer, which decides last-write-wins during merges.
    id: u64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    /// Byte size of the data section, excluding the trailer.
    size: u64,
    index: BTreeMap<Vec<u8>, u64>,
    bloom: Option<BloomFilter>,
}

impl SsTable {
    /// Writes a new table from entries already sorted by ascending key and
    /// returns its handle. The caller owns the ordering guarantee; both
    /// memtable dumps and merge output provide it.
    pub fn create(
        path: impl Into<PathBuf>,
        id: u64,
        entries: &[(Vec<u8>, Vec<u8>)],
        use_bloom: bool,
    ) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        let mut digest = CRC32.digest();

        let mut index = BTreeMap::new();
        let mut offset = 0u64;
        for (key, value) in entries {
            let mut record = Vec::with_capacity(4 + key.len() + value.len());
            record.write_u16::<BigEndian>(key.len() as u16).unwrap();
            record.extend_from_slice(key);
            record.write_u16::<BigEndian>(value.len() as u16).unwrap();
            record.extend_from_slice(value);

            digest.update(&record);
            writer.write_all(&record)?;
            index.insert(key.clone(), offset);
            offset += record.len() as u64;
        }

        writer.write_u32::<BigEndian>(digest.finalize())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        let bloom = use_bloom.then(|| {
            let mut filter = BloomFilter::with_capacity(entries.len());
            for (key, _) in entries {
                filter.add(key);
            }
            filter
        });

        Ok(Self {
            path,
            id,
            min_key: entries.first().map(|(k, _)| k.clone()).unwrap_or_default(),
            max_key: entries.last().map(|(k, _)| k.clone()).unwrap_or_default(),
            size: offset,
            index,
            bloom,
        })
    }

    /// Opens an existing table: scans every record to rebuild the index,
    /// verifies the checksum trailer, and optionally repopulates the bloom
    /// filter from the indexed keys.
    pub fn open(path: impl Into<PathBuf>, use_bloom: bool) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < TRAILER_SIZE {
            return errcorrupt!("sstable {} too small for a trailer", path.display());
        }
        let data_len = file_size - TRAILER_SIZE;

        let mut reader = BufReader::new(file);
        let mut digest = CRC32.digest();
        let mut index = BTreeMap::new();
        let mut min_key: Option<Vec<u8>> = None;
        let mut max_key: Option<Vec<u8>> = None;

        let mut offset = 0u64;
        while offset < data_len {
            let (key, value) = read_record(&mut reader, data_len - offset).map_err(|e| {
                Error::Corrupted(format!("sstable {} at offset {offset}: {e}", path.display()))
            })?;

            let mut record = Vec::with_capacity(4 + key.len() + value.len());
            record.write_u16::<BigEndian>(key.len() as u16).unwrap();
            record.extend_from_slice(&key);
            record.write_u16::<BigEndian>(value.len() as u16).unwrap();
            record.extend_from_slice(&value);
            digest.update(&record);

            if min_key.is_none() {
                min_key = Some(key.clone());
            }
            max_key = Some(key.clone());
            index.insert(key, offset);
            offset += record.len() as u64;
        }

        let stored = reader.read_u32::<BigEndian>()?;
        let computed = digest.finalize();
        if stored != computed {
            return errcorrupt!(
                "sstable {} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}",
                path.display()
            );
        }

        let bloom = use_bloom.then(|| {
            let mut filter = BloomFilter::with_capacity(index.len());
            for key in index.keys() {
                filter.add(key);
            }
            filter
        });

        let id = parse_table_id(&path);
        Ok(Self {
            path,
            id,
            min_key: min_key.unwrap_or_default(),
            max_key: max_key.unwrap_or_default(),
            size: data_len,
            index,
            bloom,
        })
    }

    /// Point lookup. Opens the file on demand and seeks to the indexed
    /// record offset.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(&offset) = self.index.get(key) else {
            return Ok(None);
        };

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);
        let (_, value) = read_record(&mut reader, u64::MAX)
            .map_err(|e| Error::Corrupted(format!("sstable {}: {e}", self.path.display())))?;
        Ok(Some(value))
    }

    /// False only when the key is definitely absent. Tables without a
    /// filter answer true and fall through to the index.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom
            .as_ref()
            .map_or(true, |filter| filter.might_contain(key))
    }

    /// True if the key falls inside this table's min/max range.
    pub fn covers(&self, key: &[u8]) -> bool {
        !self.index.is_empty()
            && key >= self.min_key.as_slice()
            && key <= self.max_key.as_slice()
    }

    /// Sequential iterator over all records, for compaction merges.
    pub fn iter(&self) -> Result<SsTableIter> {
        let file = File::open(&self.path)?;
        Ok(SsTableIter {
            reader: BufReader::new(file),
            remaining: self.size,
            path: self.path.clone(),
        })
    }

    /// Deletes the backing file, consuming the handle. Used when compaction
    /// retires its inputs.
    pub fn remove(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// Data-section size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> Vec<Vec<u8>> {
        self.index.keys().cloned().collect()
    }
}

/// Extracts the timestamp id from a `db.sst.<nanos>.sst` file name.
fn parse_table_id(path: &Path) -> u64 {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').nth(2))
        .and_then(|id| id.parse().ok())
        .unwrap_or(0)
}

/// Reads one record, refusing to read past `remaining` bytes of the data
/// section so a truncated file surfaces as corruption instead of consuming
/// the trailer.
fn read_record<R: Read>(reader: &mut R, remaining: u64) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    use std::io::{Error as IoError, ErrorKind};

    let too_short = || IoError::new(ErrorKind::UnexpectedEof, "record runs past data section");

    if remaining < 2 {
        return Err(too_short());
    }
    let key_len = reader.read_u16::<BigEndian>()? as u64;
    if remaining < 2 + key_len + 2 {
        return Err(too_short());
    }
    let mut key = vec![0u8; key_len as usize];
    reader.read_exact(&mut key)?;

    let value_len = reader.read_u16::<BigEndian>()? as u64;
    if remaining < 2 + key_len + 2 + value_len {
        return Err(too_short());
    }
    let mut value = vec![0u8; value_len as usize];
    reader.read_exact(&mut value)?;

    Ok((key, value))
}

/// Streams records in file (and therefore key) order.
pub struct SsTableIter {
    reader: BufReader<File>,
    remaining: u64,
    path: PathBuf,
}

impl Iterator for SsTableIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match read_record(&mut self.reader, self.remaining) {
            Ok((key, value)) => {
                self.remaining -= (4 + key.len() + value.len()) as u64;
                Some(Ok((key, value)))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(Error::Corrupted(format!(
                    "sstable {}: {e}",
                    self.path.display()
                ))))
            }
        }
    }
}
