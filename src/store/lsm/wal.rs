//! Write-ahead log for the LSM backend.
//!
//! Mutations are logged before they touch the memtable, so a crash loses
//! at most writes that were never acknowledged as durable. Appends go
//! through a bounded channel into a single writer thread; the channel
//! backpressures producers when the worker falls behind.
//!
//! ## Record format
//!
//! ```text
//! +----------+--------------+-----+--------------+-------+
//! | op: u8   | key len: u16 | key | val len: u16 | value |
//! +----------+--------------+-----+--------------+-------+
//! ```
//!
//! Big-endian lengths. Op `0x00` is an insert, `0x01` a delete; delete
//! records carry a zero-length value. `flush()` guarantees that every
//! append that returned before the flush began is on disk when it returns.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const OP_INSERT: u8 = 0x00;
const OP_DELETE: u8 = 0x01;

/// Bounded channel capacity between producers and the writer thread.
const CHANNEL_CAPACITY: usize = 30_000;

/// A single logged mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalEntry {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl WalEntry {
    fn encode(&self) -> Vec<u8> {
        let (op, key, value): (u8, &[u8], &[u8]) = match self {
            WalEntry::Insert { key, value } => (OP_INSERT, key, value),
            WalEntry::Delete { key } => (OP_DELETE, key, &[]),
        };

        let mut buf = Vec::with_capacity(5 + key.len() + value.len());
        buf.push(op);
        // Writing into a Vec cannot fail.
        buf.write_u16::<BigEndian>(key.len() as u16).unwrap();
        buf.extend_from_slice(key);
        buf.write_u16::<BigEndian>(value.len() as u16).unwrap();
        buf.extend_from_slice(value);
        buf
    }
}

/// The write-ahead log: an append-only file behind a writer thread.
pub struct Wal {
    /// Cleared on close; a vacant sender rejects appends with `WalClosed`.
    tx: Mutex<Option<SyncSender<WalEntry>>>,
    /// Entries accepted but not yet written by the worker.
    pending: Arc<AtomicU64>,
    file: Arc<Mutex<File>>,
    path: PathBuf,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Opens or creates the log file and starts the writer thread.
    pub fn open(path: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let file = Arc::new(Mutex::new(file));
        let pending = Arc::new(AtomicU64::new(0));

        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        let worker = {
            let file = Arc::clone(&file);
            let pending = Arc::clone(&pending);
            std::thread::Builder::new()
                .name("emberdb-wal".to_string())
                .spawn(move || Self::worker_loop(rx, file, pending, sync_writes))
                .map_err(|e| Error::IO(format!("failed to spawn wal worker: {e}")))?
        };

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            pending,
            file,
            path,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn worker_loop(
        rx: Receiver<WalEntry>,
        file: Arc<Mutex<File>>,
        pending: Arc<AtomicU64>,
        sync_writes: bool,
    ) {
        for entry in rx {
            let buf = entry.encode();
            let result = (|| -> Result<()> {
                let mut file = file.lock()?;
                file.write_all(&buf)?;
                if sync_writes {
                    file.sync_data()?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                tracing::error!(error = %e, "wal write failed");
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Enqueues an entry for the writer thread. Returns once the entry is
    /// accepted, not once it is durable; blocks when the channel is full.
    pub fn append(&self, entry: WalEntry) -> Result<()> {
        // Clone the sender so a full channel backpressures outside the
        // lock instead of serializing every producer on it.
        let tx = self
            .tx
            .lock()?
            .as_ref()
            .cloned()
            .ok_or(Error::WalClosed)?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = tx.send(entry) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    /// Waits for the worker to drain every accepted entry, then fsyncs.
    pub fn flush(&self) -> Result<()> {
        while self.pending.load(Ordering::SeqCst) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.file.lock()?.sync_all()?;
        Ok(())
    }

    /// Flushes, then truncates the log and resets the append cursor.
    pub fn reset(&self) -> Result<()> {
        self.flush()?;

        let mut file = self.file.lock()?;
        *file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Flushes outstanding entries and stops the writer thread. Further
    /// appends fail with `WalClosed`. Idempotent.
    pub fn close(&self) -> Result<()> {
        let sender = self.tx.lock()?.take();
        if sender.is_none() {
            return Ok(());
        }
        self.flush()?;
        drop(sender); // Disconnects the channel; the worker drains and exits.

        if let Some(worker) = self.worker.lock()?.take() {
            worker
                .join()
                .map_err(|_| Error::IO("wal worker panicked".to_string()))?;
        }
        Ok(())
    }

    /// Entries accepted but not yet written.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the log file from the start.
    pub fn replay(path: &Path) -> Result<ReplayIterator> {
        ReplayIterator::new(path)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close wal on drop");
        }
    }
}

/// Iterates the records of a WAL file in append order. A clean end of file
/// ends the iteration; a record torn mid-field is treated the same way
/// (the tail was never acknowledged as durable) but logged.
pub struct ReplayIterator {
    reader: BufReader<File>,
    done: bool,
}

impl ReplayIterator {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            done: false,
        })
    }

    fn read_entry(&mut self) -> Result<Option<WalEntry>> {
        let op = match self.reader.read_u8() {
            Ok(op) => op,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry = (|| -> std::io::Result<WalEntry> {
            let key_len = self.reader.read_u16::<BigEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            self.reader.read_exact(&mut key)?;

            let value_len = self.reader.read_u16::<BigEndian>()? as usize;
            let mut value = vec![0u8; value_len];
            self.reader.read_exact(&mut value)?;

            Ok(match op {
                OP_DELETE => WalEntry::Delete { key },
                _ => WalEntry::Insert { key, value },
            })
        })();

        match entry {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::warn!("wal ends mid-record, treating torn tail as end of log");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
