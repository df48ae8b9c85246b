use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::{AppResponses, State, StateStore};
use crate::app::{AppConnection, AppError, LastCommitInfo, Misbehavior, RequestBeginBlock, VoteInfo};
use crate::common::crypto::Hash;
use crate::evidence::EvidencePool;
use crate::mempool::TxSource;
use crate::storage::StoreError;
use crate::types::{
    Block, BlockId, CommitError, Hashable, Header, ParamsError, ValidatorSet, ValidatorSetError,
};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid last commit: {0}")]
    InvalidCommit(#[from] CommitError),

    #[error("application error: {0}")]
    App(#[from] AppError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid validator updates: {0}")]
    ValidatorUpdates(#[from] ValidatorSetError),

    #[error("invalid consensus param updates: {0}")]
    ParamUpdates(#[from] ParamsError),
}

fn invalid<T>(msg: String) -> Result<T, ExecError> {
    Err(ExecError::InvalidBlock(msg))
}

/// Checks a proposed block against the chain state it would extend.
pub fn validate_block(state: &State, block: &Block) -> Result<(), ExecError> {
    block.validate_basic().map_err(ExecError::InvalidBlock)?;
    let header = &block.header;
    if header.chain_id != state.chain_id {
        return invalid(format!("wrong chain_id {}", header.chain_id));
    }
    if header.height != state.next_height() {
        return invalid(format!(
            "wrong height {}, expected {}",
            header.height,
            state.next_height()
        ));
    }
    if header.last_block_id != state.last_block_id {
        return invalid(format!("wrong last_block_id {}", header.last_block_id.short()));
    }
    if header.total_txs != state.last_block_total_tx + header.num_txs {
        return invalid(format!("wrong total_txs {}", header.total_txs));
    }
    if header.app_hash != state.app_hash {
        return invalid("wrong app_hash".to_string());
    }
    if header.consensus_hash != state.consensus_params.hash() {
        return invalid("wrong consensus_hash".to_string());
    }
    if header.last_results_hash != state.last_results_hash {
        return invalid("wrong last_results_hash".to_string());
    }
    if header.validators_hash != state.validators.hash() {
        return invalid("wrong validators_hash".to_string());
    }
    if !state.validators.has_address(&header.proposer_address) {
        return invalid(format!("proposer {} is not a validator", header.proposer_address));
    }
    if block.txs.len() as i64 > state.consensus_params.block_size.max_txs {
        return invalid(format!("too many txs: {}", block.txs.len()));
    }

    if state.is_initial_height(header.height) {
        if !block.last_commit.precommits.is_empty() {
            return invalid("initial block cannot carry a last commit".to_string());
        }
    } else {
        if header.time <= state.last_block_time {
            return invalid(format!("block time {:?} not after last block", header.time));
        }
        state.last_validators.verify_commit(
            &state.chain_id,
            &state.last_block_id,
            header.height - 1,
            &block.last_commit,
        )?;
    }

    for ev in &block.evidence {
        ev.verify(&state.chain_id)
            .map_err(|e| ExecError::InvalidBlock(format!("evidence: {}", e)))?;
        if ev.height() < header.height - state.consensus_params.evidence.max_age {
            return invalid(format!("evidence from height {} is too old", ev.height()));
        }
    }
    Ok(())
}

/// Drives the application through begin/deliver/end for one block and
/// collects the responses. Does not commit.
pub fn exec_block_on_app(
    app: &mut dyn AppConnection,
    block: &Block,
    last_validators: &ValidatorSet,
) -> Result<AppResponses, AppError> {
    let mut votes = Vec::with_capacity(last_validators.size());
    for (i, val) in last_validators.validators().iter().enumerate() {
        let signed = block
            .last_commit
            .precommits
            .get(i)
            .map(|p| p.is_some())
            .unwrap_or(false);
        votes.push(VoteInfo {
            address: val.address,
            power: val.voting_power,
            signed_last_block: signed,
        });
    }
    let byzantine_validators = block
        .evidence
        .iter()
        .map(|ev| Misbehavior {
            address: ev.address(),
            height: ev.height(),
        })
        .collect();

    app.begin_block(RequestBeginBlock {
        hash: block.hash(),
        header: block.header.clone(),
        last_commit_info: LastCommitInfo {
            round: block.last_commit.round(),
            votes,
        },
        byzantine_validators,
    })?;

    let mut deliver_txs = Vec::with_capacity(block.txs.len());
    let mut invalid = 0;
    for tx in &block.txs {
        let res = app.deliver_tx(tx)?;
        if !res.is_ok() {
            invalid += 1;
        }
        deliver_txs.push(res);
    }
    let end_block = app.end_block(block.height())?;
    debug!(
        height = block.height(),
        valid_txs = deliver_txs.len() - invalid,
        invalid_txs = invalid,
        "executed block"
    );
    Ok(AppResponses { deliver_txs, end_block })
}

/// Executes and commits a block on the application without touching chain
/// state. Used when the state already reflects the block.
pub fn exec_commit_block(
    app: &mut dyn AppConnection,
    block: &Block,
    last_validators: &ValidatorSet,
) -> Result<Hash, AppError> {
    exec_block_on_app(app, block, last_validators)?;
    let res = app.commit()?;
    info!(height = block.height(), app_hash = %hex::encode(&res.app_hash[..6]), "committed block on app");
    Ok(res.app_hash)
}

/// Chain state after `header` with the given responses. The app hash is
/// left for the caller to fill in after commit.
pub fn update_state(
    state: &State,
    block_id: &BlockId,
    header: &Header,
    responses: &AppResponses,
) -> Result<State, ExecError> {
    let height = header.height;

    let mut next_validators = state.validators.clone();
    let mut last_height_validators_changed = state.last_height_validators_changed;
    let updates = &responses.end_block.validator_updates;
    if !updates.is_empty() {
        next_validators.apply_updates(updates)?;
        last_height_validators_changed = height + 1;
        info!(height, updates = updates.len(), "validator set updated");
    }
    next_validators.increment_proposer_priority(1);

    let mut next_params = state.consensus_params;
    let mut last_height_params_changed = state.last_height_consensus_params_changed;
    if let Some(update) = &responses.end_block.consensus_param_updates {
        next_params = state.consensus_params.update(update);
        next_params.validate()?;
        last_height_params_changed = height + 1;
    }

    Ok(State {
        chain_id: state.chain_id.clone(),
        initial_height: state.initial_height,
        last_block_height: height,
        last_block_total_tx: state.last_block_total_tx + header.num_txs,
        last_block_id: *block_id,
        last_block_time: header.time,
        validators: next_validators,
        last_validators: state.validators.clone(),
        last_height_validators_changed,
        consensus_params: next_params,
        last_height_consensus_params_changed: last_height_params_changed,
        last_results_hash: responses.results_hash(),
        app_hash: state.app_hash,
    })
}

/*
    BlockExecutor applies an agreed block:

        validate -> begin/deliver/end -> save responses -> update state
                 -> commit -> update tx source and evidence -> save state

    Responses are saved before commit so a crash between commit and state
    save can be recovered without re-running the application.
*/
pub struct BlockExecutor {
    store: StateStore,
    app: Box<dyn AppConnection>,
    tx_source: Arc<dyn TxSource>,
    evidence_pool: Arc<dyn EvidencePool>,
}

impl BlockExecutor {
    pub fn new(
        store: StateStore,
        app: Box<dyn AppConnection>,
        tx_source: Arc<dyn TxSource>,
        evidence_pool: Arc<dyn EvidencePool>,
    ) -> Self {
        BlockExecutor {
            store,
            app,
            tx_source,
            evidence_pool,
        }
    }

    /// An executor sharing this one's stores but driving another application.
    pub fn with_app(&self, app: Box<dyn AppConnection>) -> BlockExecutor {
        BlockExecutor {
            store: self.store.clone(),
            app,
            tx_source: self.tx_source.clone(),
            evidence_pool: self.evidence_pool.clone(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn app_mut(&mut self) -> &mut dyn AppConnection {
        self.app.as_mut()
    }

    pub fn tx_source(&self) -> &Arc<dyn TxSource> {
        &self.tx_source
    }

    pub fn evidence_pool(&self) -> &Arc<dyn EvidencePool> {
        &self.evidence_pool
    }

    pub fn validate_block(&self, state: &State, block: &Block) -> Result<(), ExecError> {
        validate_block(state, block)
    }

    pub fn apply_block(&mut self, state: &State, block_id: &BlockId, block: &Block) -> Result<State, ExecError> {
        validate_block(state, block)?;

        let responses = exec_block_on_app(self.app.as_mut(), block, &state.last_validators)?;
        self.store.save_app_responses(block.height(), &responses)?;

        let mut next = update_state(state, block_id, &block.header, &responses)?;

        let committed = self.app.commit()?;
        self.tx_source.update(block.height(), &block.txs);
        self.evidence_pool.update(block);

        next.app_hash = committed.app_hash;
        self.store.save(&next)?;
        info!(
            height = block.height(),
            txs = block.txs.len(),
            app_hash = %hex::encode(&next.app_hash[..6]),
            "applied block"
        );
        Ok(next)
    }
}
