//! Source of candidate transactions for proposals.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;
use thiserror::Error;
use tracing::{debug, trace};

use crate::common::crypto::{sha256, Hash};
use crate::types::{Height, Tx};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool")]
    Duplicate,

    #[error("transaction of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("mempool is full")]
    Full,

    #[error("mempool lock poisoned")]
    Poisoned,
}

pub trait TxSource: Send + Sync {
    /// Oldest-first batch whose total size stays within `max_bytes` and total
    /// gas within `max_gas` (-1 for no gas limit).
    fn reap(&self, max_bytes: i64, max_gas: i64) -> Vec<Tx>;

    /// Removes transactions committed at `height`.
    fn update(&self, height: Height, committed: &[Tx]);

    fn size(&self) -> usize;
}

type Notify = Box<dyn Fn() + Send + Sync>;

/// Recently committed hashes remembered to turn away replays.
pub const COMMITTED_CACHE_SIZE: usize = 10_000;

struct Pool {
    txs: VecDeque<Tx>,
    pending: HashSet<Hash>,
    committed: LruCache<Hash, ()>,
    notified: bool,
}

/// In-memory FIFO pool. Each transaction costs one unit of gas.
pub struct MemTxPool {
    pool: Mutex<Pool>,
    max_txs: usize,
    max_tx_bytes: usize,
    txs_available: Mutex<Option<Notify>>,
}

impl MemTxPool {
    pub fn new(max_txs: usize, max_tx_bytes: usize) -> Self {
        Self::with_committed_cache(max_txs, max_tx_bytes, COMMITTED_CACHE_SIZE)
    }

    pub fn with_committed_cache(max_txs: usize, max_tx_bytes: usize, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        MemTxPool {
            pool: Mutex::new(Pool {
                txs: VecDeque::new(),
                pending: HashSet::new(),
                committed: LruCache::new(cache_size),
                notified: false,
            }),
            max_txs,
            max_tx_bytes,
            txs_available: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Pool>, MempoolError> {
        self.pool.lock().map_err(|_| MempoolError::Poisoned)
    }

    /// Registers a callback fired once per height when the pool becomes non-empty.
    pub fn set_txs_available<F: Fn() + Send + Sync + 'static>(&self, notify: F) {
        if let Ok(mut slot) = self.txs_available.lock() {
            *slot = Some(Box::new(notify));
        }
    }

    pub fn check_tx(&self, tx: Tx) -> Result<(), MempoolError> {
        if tx.len() > self.max_tx_bytes {
            return Err(MempoolError::TooLarge(tx.len()));
        }
        let fire = {
            let mut pool = self.lock()?;
            if pool.txs.len() >= self.max_txs {
                return Err(MempoolError::Full);
            }
            let hash = sha256(&tx);
            if pool.pending.contains(&hash) || pool.committed.contains(&hash) {
                return Err(MempoolError::Duplicate);
            }
            pool.pending.insert(hash);
            pool.txs.push_back(tx);
            trace!(size = pool.txs.len(), "added tx to mempool");
            let fire = !pool.notified;
            pool.notified = true;
            fire
        };
        if fire {
            self.notify_txs_available();
        }
        Ok(())
    }

    fn notify_txs_available(&self) {
        if let Ok(slot) = self.txs_available.lock() {
            if let Some(notify) = slot.as_ref() {
                notify();
            }
        }
    }
}

impl TxSource for MemTxPool {
    fn reap(&self, max_bytes: i64, max_gas: i64) -> Vec<Tx> {
        let Ok(pool) = self.lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut bytes: i64 = 0;
        let mut gas: i64 = 0;
        for tx in pool.txs.iter() {
            let next_bytes = bytes + tx.len() as i64;
            if max_bytes > -1 && next_bytes > max_bytes {
                break;
            }
            if max_gas > -1 && gas + 1 > max_gas {
                break;
            }
            bytes = next_bytes;
            gas += 1;
            out.push(tx.clone());
        }
        out
    }

    fn update(&self, height: Height, committed: &[Tx]) {
        let fire = {
            let Ok(mut pool) = self.lock() else { return };
            let hashes: Vec<Hash> = committed.iter().map(|tx| sha256(tx)).collect();
            {
                let removed: HashSet<&Hash> = hashes.iter().collect();
                pool.txs.retain(|tx| !removed.contains(&sha256(tx)));
            }
            for hash in hashes {
                pool.pending.remove(&hash);
                pool.committed.put(hash, ());
            }
            pool.notified = false;
            debug!(height, remaining = pool.txs.len(), "mempool updated");
            if pool.txs.is_empty() {
                false
            } else {
                pool.notified = true;
                true
            }
        };
        if fire {
            self.notify_txs_available();
        }
    }

    fn size(&self) -> usize {
        self.lock().map(|p| p.txs.len()).unwrap_or(0)
    }
}
