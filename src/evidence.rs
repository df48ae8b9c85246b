//! Pool of observed misbehavior awaiting inclusion in a block.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use tracing::{info, warn};

use crate::common::crypto::Hash;
use crate::types::{Block, Evidence, Height};

pub trait EvidencePool: Send + Sync {
    /// Evidence not yet committed, oldest first, at most `max`.
    fn pending_evidence(&self, max: usize) -> Vec<Evidence>;

    /// Records newly observed misbehavior. Returns false if already known.
    fn add_evidence(&self, evidence: Evidence) -> bool;

    /// Drops evidence included in the committed block.
    fn update(&self, block: &Block);
}

#[derive(Default)]
struct Inner {
    pending: Vec<Evidence>,
    known: HashSet<Hash>,
    committed: HashSet<Hash>,
    last_height: Height,
}

pub struct MemEvidencePool {
    chain_id: String,
    max_age: i64,
    inner: Mutex<Inner>,
}

impl MemEvidencePool {
    pub fn new(chain_id: &str, max_age: i64) -> Self {
        MemEvidencePool {
            chain_id: chain_id.to_string(),
            max_age,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        self.inner.lock().ok()
    }

    pub fn is_committed(&self, evidence: &Evidence) -> bool {
        self.lock()
            .map(|i| i.committed.contains(&evidence.hash()))
            .unwrap_or(false)
    }
}

impl EvidencePool for MemEvidencePool {
    fn pending_evidence(&self, max: usize) -> Vec<Evidence> {
        self.lock()
            .map(|i| i.pending.iter().take(max).cloned().collect())
            .unwrap_or_default()
    }

    fn add_evidence(&self, evidence: Evidence) -> bool {
        if let Err(e) = evidence.verify(&self.chain_id) {
            warn!(err = %e, "rejecting invalid evidence");
            return false;
        }
        let Some(mut inner) = self.lock() else { return false };
        if inner.last_height > 0 && evidence.height() < inner.last_height - self.max_age {
            warn!(height = evidence.height(), "rejecting expired evidence");
            return false;
        }
        let hash = evidence.hash();
        if !inner.known.insert(hash) {
            return false;
        }
        info!(address = %evidence.address(), height = evidence.height(), "new evidence of misbehavior");
        inner.pending.push(evidence);
        true
    }

    fn update(&self, block: &Block) {
        let Some(mut inner) = self.lock() else { return };
        for ev in &block.evidence {
            inner.committed.insert(ev.hash());
        }
        let Inner { pending, committed, .. } = &mut *inner;
        pending.retain(|ev| !committed.contains(&ev.hash()));
        inner.last_height = block.height();
    }
}
