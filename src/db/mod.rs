//! Database aggregate: named logical tables over one storage engine.
//!
//! Tables are namespaces, not separate stores. Every row of table `t` is
//! stored under the key `t:<key>`, so the engine sees a single ordered
//! map. The table list itself is persisted: for the B-tree backend it
//! lives on page 1 of the database file (page 0 belongs to the tree
//! header), for the LSM backend under a reserved system key outside every
//! table namespace.
//!
//! Registry wire format, either way:
//!
//! ```text
//! +-------------------+--------------------+------+ ...
//! | table count: u32  | name len: u16      | name |
//! +-------------------+--------------------+------+ ...
//! ```
//!
//! Little-endian, one length-prefixed name per table.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Cursor;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::config::{BtreeConfig, LsmConfig};
use crate::errinput;
use crate::error::{Error, Result};
use crate::store::{BtreeStore, LsmStore, Storage, StorageEngine};

/// Reserved key holding the table registry on the LSM backend. The leading
/// NUL keeps it outside every `<table>:<key>` namespace.
const REGISTRY_KEY: &[u8] = b"\x00emberdb:tables";

/// Default cap on the number of tables.
const DEFAULT_MAX_TABLES: usize = 100;

/// Which backend a database runs on, fixed at open time.
pub enum BackendConfig {
    /// Single-file B-tree; the registry occupies page 1 of the same file.
    Btree { path: PathBuf, config: BtreeConfig },
    /// LSM directory; the registry lives under a reserved engine key.
    Lsm(LsmConfig),
}

pub struct DatabaseConfig {
    pub name: String,
    pub max_tables: usize,
    pub backend: BackendConfig,
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>, backend: BackendConfig) -> Self {
        Self {
            name: name.into(),
            max_tables: DEFAULT_MAX_TABLES,
            backend,
        }
    }

    pub fn max_tables(mut self, max_tables: usize) -> Self {
        self.max_tables = max_tables;
        self
    }
}

/// Observed state of a database.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DatabaseStatus {
    pub table_count: usize,
    pub ready: bool,
    pub error: Option<String>,
}

/// How the table list is persisted.
enum Registry {
    /// Page 1 of the B-tree file.
    Page { file: File, page_size: usize },
    /// A reserved key in the engine itself.
    Key,
}

impl Registry {
    fn load(&self, engine: &StorageEngine) -> Result<BTreeSet<String>> {
        let data = match self {
            Registry::Page { file, page_size } => {
                let mut page = vec![0u8; *page_size];
                file.read_exact_at(&mut page, *page_size as u64)?;
                page
            }
            Registry::Key => match engine.get(REGISTRY_KEY) {
                Ok(data) => data,
                Err(Error::KeyNotFound) => return Ok(BTreeSet::new()),
                Err(e) => return Err(e),
            },
        };
        decode_registry(&data)
    }

    fn save(&self, engine: &StorageEngine, tables: &BTreeSet<String>) -> Result<()> {
        let data = encode_registry(tables);
        match self {
            Registry::Page { file, page_size } => {
                if data.len() > *page_size {
                    return errinput!(
                        "table registry of {} bytes exceeds page size {page_size}",
                        data.len()
                    );
                }
                let mut page = vec![0u8; *page_size];
                page[..data.len()].copy_from_slice(&data);
                file.write_all_at(&page, *page_size as u64)?;
                file.sync_all()?;
                Ok(())
            }
            Registry::Key => engine.insert(REGISTRY_KEY, data),
        }
    }
}

fn encode_registry(tables: &BTreeSet<String>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(tables.len() as u32).unwrap();
    for name in tables {
        buf.write_u16::<LittleEndian>(name.len() as u16).unwrap();
        buf.extend_from_slice(name.as_bytes());
    }
    buf
}

fn decode_registry(data: &[u8]) -> Result<BTreeSet<String>> {
    let mut cursor = Cursor::new(data);
    let count = cursor.read_u32::<LittleEndian>()?;

    let mut tables = BTreeSet::new();
    for _ in 0..count {
        let len = cursor.read_u16::<LittleEndian>()? as usize;
        let start = cursor.position() as usize;
        if start + len > data.len() {
            return Err(Error::Corrupted(
                "table registry entry runs past the page".to_string(),
            ));
        }
        let name = String::from_utf8(data[start..start + len].to_vec())
            .map_err(|_| Error::Corrupted("table name is not valid utf-8".to_string()))?;
        cursor.set_position((start + len) as u64);
        tables.insert(name);
    }
    Ok(tables)
}

/// A database: a storage engine plus a registry of named tables.
pub struct Database {
    name: String,
    max_tables: usize,
    engine: StorageEngine,
    registry: Registry,
    tables: RwLock<BTreeSet<String>>,
    last_error: RwLock<Option<String>>,
    closed: AtomicBool,
}

impl Database {
    /// Opens a database, creating the backing storage if needed and
    /// loading the persisted table list.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        if config.name.is_empty() {
            return errinput!("database name is required");
        }
        let max_tables = if config.max_tables == 0 {
            DEFAULT_MAX_TABLES
        } else {
            config.max_tables
        };

        let (engine, registry) = match config.backend {
            BackendConfig::Btree { path, config: bt } => {
                bt.validate()?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(&path)?;

                // Reserve the header page and the registry page up front.
                let min_size = (bt.page_size * 2) as u64;
                if file.metadata()?.len() < min_size {
                    file.set_len(min_size)?;
                }

                let page_size = bt.page_size;
                let store = BtreeStore::with_file(file.try_clone()?, bt)?;
                (
                    StorageEngine::Btree(store),
                    Registry::Page { file, page_size },
                )
            }
            BackendConfig::Lsm(lsm) => {
                let store = LsmStore::open(lsm)?;
                (StorageEngine::Lsm(store), Registry::Key)
            }
        };

        let tables = registry.load(&engine)?;
        tracing::info!(
            database = %config.name,
            tables = tables.len(),
            "opened database"
        );

        Ok(Self {
            name: config.name,
            max_tables,
            engine,
            registry,
            tables: RwLock::new(tables),
            last_error: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(format!(
                "database {} is closed",
                self.name
            )));
        }
        Ok(())
    }

    fn record_error(&self, err: &Error) {
        if let Ok(mut last) = self.last_error.write() {
            *last = Some(err.to_string());
        }
    }

    fn check_table_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return errinput!("table name is required");
        }
        if name.contains(':') {
            return errinput!("table name {name} must not contain ':'");
        }
        // Control bytes could smuggle a prefixed key into the reserved
        // registry namespace, which leads with NUL.
        if name.bytes().any(|b| b.is_ascii_control()) {
            return errinput!("table name must not contain control characters");
        }
        Ok(())
    }

    /// Registers a new table and persists the updated registry.
    pub fn create_table(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        Self::check_table_name(name)?;

        let mut tables = self.tables.write()?;
        if tables.len() >= self.max_tables {
            let err = Error::TableLimitExceeded;
            self.record_error(&err);
            return Err(err);
        }
        if tables.contains(name) {
            return errinput!("table {name} already exists");
        }

        tables.insert(name.to_string());
        if let Err(e) = self.registry.save(&self.engine, &tables) {
            tables.remove(name);
            self.record_error(&e);
            return Err(e);
        }

        tracing::info!(database = %self.name, table = name, "created table");
        Ok(())
    }

    /// Unregisters a table. Its rows remain in the engine but become
    /// unreachable through the database interface.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.ensure_open()?;

        let mut tables = self.tables.write()?;
        if !tables.remove(name) {
            let err = Error::InvalidInput(format!("table {name} not found"));
            self.record_error(&err);
            return Err(err);
        }

        if let Err(e) = self.registry.save(&self.engine, &tables) {
            tables.insert(name.to_string());
            self.record_error(&e);
            return Err(e);
        }

        tracing::info!(database = %self.name, table = name, "dropped table");
        Ok(())
    }

    fn check_table_exists(&self, name: &str) -> Result<()> {
        if !self.tables.read()?.contains(name) {
            return errinput!("table {name} not found");
        }
        Ok(())
    }

    /// Inserts a key-value pair into a table.
    pub fn insert(&self, table: &str, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        self.check_table_exists(table)?;

        self.engine
            .insert(&prefixed_key(table, key), value)
            .inspect_err(|e| self.record_error(e))
    }

    /// Retrieves a value from a table by key.
    pub fn get(&self, table: &str, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.check_table_exists(table)?;

        self.engine.get(&prefixed_key(table, key))
    }

    /// Removes a key-value pair from a table.
    pub fn delete(&self, table: &str, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.check_table_exists(table)?;

        self.engine
            .delete(&prefixed_key(table, key))
            .inspect_err(|e| self.record_error(e))
    }

    /// The registered table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        self.tables
            .read()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn status(&self) -> DatabaseStatus {
        DatabaseStatus {
            table_count: self.tables.read().map(|t| t.len()).unwrap_or(0),
            ready: !self.closed.load(Ordering::SeqCst),
            error: self.last_error.read().ok().and_then(|e| e.clone()),
        }
    }

    /// Backend statistics, see [`StorageEngine::stats`].
    pub fn stats(&self) -> std::collections::BTreeMap<String, u64> {
        self.engine.stats()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shuts the engine down. Idempotent; later operations fail with
    /// `InvalidState`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.close()?;
        tracing::info!(database = %self.name, "closed database");
        Ok(())
    }
}

fn prefixed_key(table: &str, key: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(table.len() + 1 + key.len());
    prefixed.extend_from_slice(table.as_bytes());
    prefixed.push(b':');
    prefixed.extend_from_slice(key);
    prefixed
}
