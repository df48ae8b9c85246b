//! Key-value persistence behind the chain-state and block stores.
//!
//! `MemDb` backs tests; `RocksDb` is the on-disk store, with every write
//! synced before it returns.

pub mod block_store;

pub use block_store::*;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use rocksdb::{Options, WriteOptions, DB};
use thiserror::Error;

use crate::types::CodecError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("store codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("missing entry: {0}")]
    Missing(String),
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Durable write: returns once the value survives a crash.
    fn set_sync(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemDb {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        MemDb::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemDb {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set_sync(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// RocksDB-backed store. String keys map to byte keys unchanged.
pub struct RocksDb {
    db: DB,
}

impl RocksDb {
    /// Opens or creates the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&path)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(RocksDb { db })
    }
}

impl KvStore for RocksDb {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn set_sync(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.put_opt(key.as_bytes(), value, &write_opts)?;
        Ok(())
    }
}
