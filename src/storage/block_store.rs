use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{KvStore, StoreError};
use crate::types::{decode, encode, Block, BlockId, Commit, Header, Height};

const HEIGHT_KEY: &str = "blockStore";

fn block_key(height: Height) -> String {
    format!("B:{}", height)
}

fn meta_key(height: Height) -> String {
    format!("H:{}", height)
}

fn seen_commit_key(height: Height) -> String {
    format!("SC:{}", height)
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub header: Header,
}

/// Committed blocks by height, with the commit this node saw for each.
/// Heights are contiguous: a block is only accepted for `height() + 1`.
#[derive(Clone)]
pub struct BlockStore {
    db: Arc<dyn KvStore>,
}

impl BlockStore {
    pub fn new(db: Arc<dyn KvStore>) -> Self {
        BlockStore { db }
    }

    pub fn height(&self) -> Result<Height, StoreError> {
        match self.db.get(HEIGHT_KEY)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(0),
        }
    }

    /// Persists the block with the precommits that committed it, then
    /// advances the store height.
    pub fn save_block(&self, block: &Block, block_id: &BlockId, seen_commit: &Commit) -> Result<(), StoreError> {
        let height = block.height();
        let current = self.height()?;
        if current != 0 && height != current + 1 {
            return Err(StoreError::Missing(format!(
                "cannot save block {} on top of store height {}",
                height, current
            )));
        }
        let meta = BlockMeta {
            block_id: *block_id,
            header: block.header.clone(),
        };
        self.db.set_sync(&block_key(height), &encode(block)?)?;
        self.db.set_sync(&meta_key(height), &encode(&meta)?)?;
        self.db.set_sync(&seen_commit_key(height), &encode(seen_commit)?)?;
        self.db.set_sync(HEIGHT_KEY, &encode(&height)?)?;
        Ok(())
    }

    pub fn load_block(&self, height: Height) -> Result<Option<Block>, StoreError> {
        match self.db.get(&block_key(height))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load_block_meta(&self, height: Height) -> Result<Option<BlockMeta>, StoreError> {
        match self.db.get(&meta_key(height))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load_seen_commit(&self, height: Height) -> Result<Option<Commit>, StoreError> {
        match self.db.get(&seen_commit_key(height))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
