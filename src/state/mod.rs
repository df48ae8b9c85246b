//! Chain state after the last committed block, and the executor that
//! advances it by applying blocks to the application.

pub mod execution;
pub mod store;

pub use execution::*;
pub use store::*;

use serde::{Deserialize, Serialize};

use crate::common::crypto::{Address, Hash};
use crate::types::{
    Block, BlockId, Commit, ConsensusParams, Evidence, GenesisDoc, GenesisError, Hashable, Header,
    Height, Timestamp, Tx, ValidatorSet,
};

/*
    State describes the latest committed block and everything needed to
    validate the next one:

        validators       sign height last_block_height + 1
        last_validators  signed height last_block_height (its commit)

    Validator and parameter changes returned by the application while
    executing height H land in this state and are used from H + 1 on.
*/
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct State {
    pub chain_id: String,
    pub initial_height: Height,

    pub last_block_height: Height,
    pub last_block_total_tx: u64,
    pub last_block_id: BlockId,
    pub last_block_time: Timestamp,

    pub validators: ValidatorSet,
    pub last_validators: ValidatorSet,
    pub last_height_validators_changed: Height,

    pub consensus_params: ConsensusParams,
    pub last_height_consensus_params_changed: Height,

    pub last_results_hash: Hash,
    pub app_hash: Hash,
}

impl State {
    /// Initial state built from the genesis document. Nothing is committed,
    /// so `last_block_height` is one below the initial height.
    pub fn from_genesis(genesis: &GenesisDoc) -> Result<State, GenesisError> {
        genesis.validate()?;
        let validators = genesis
            .validators
            .iter()
            .map(|v| v.to_validator())
            .collect::<Result<Vec<_>, _>>()?;
        let validators =
            ValidatorSet::new(validators).map_err(|e| GenesisError::Invalid(e.to_string()))?;
        Ok(State {
            chain_id: genesis.chain_id.clone(),
            initial_height: genesis.initial_height,
            last_block_height: genesis.initial_height - 1,
            last_block_total_tx: 0,
            last_block_id: BlockId::nil(),
            last_block_time: genesis.genesis_time,
            validators,
            last_validators: ValidatorSet::default(),
            last_height_validators_changed: genesis.initial_height,
            consensus_params: genesis.consensus_params,
            last_height_consensus_params_changed: genesis.initial_height,
            last_results_hash: [0u8; 32],
            app_hash: genesis.app_hash_bytes()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Height of the next block to commit.
    pub fn next_height(&self) -> Height {
        self.last_block_height + 1
    }

    pub fn is_initial_height(&self, height: Height) -> bool {
        height == self.initial_height
    }

    /// Builds the block for the next height. Block time never goes
    /// backwards relative to the previous block.
    pub fn make_block(
        &self,
        height: Height,
        txs: Vec<Tx>,
        last_commit: Commit,
        evidence: Vec<Evidence>,
        proposer_address: Address,
        now: Timestamp,
    ) -> Block {
        let time = if height == self.initial_height {
            now.max(self.last_block_time)
        } else {
            now.max(Timestamp(self.last_block_time.0 + 1))
        };
        let header = Header {
            chain_id: self.chain_id.clone(),
            height,
            time,
            total_txs: self.last_block_total_tx + txs.len() as u64,
            last_block_id: self.last_block_id,
            validators_hash: self.validators.hash(),
            consensus_hash: self.consensus_params.hash(),
            app_hash: self.app_hash,
            last_results_hash: self.last_results_hash,
            proposer_address,
            ..Header::default()
        };
        Block::new(header, txs, evidence, last_commit)
    }
}
