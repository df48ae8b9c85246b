//! Crash recovery: WAL catch-up for the current height, and the handshake
//! that brings the application level with the block store on start.

use thiserror::Error;
use tracing::{debug, info, warn};

use super::state::{ConsensusError, ConsensusState};
use super::wal::{TimedWalMessage, WalMessage};
use crate::app::{
    AppConnection, AppError, RequestBeginBlock, RequestInitChain, ResponseCommit, ResponseDeliverTx,
    ResponseEndBlock, ResponseInfo, ResponseInitChain,
};
use crate::common::crypto::Hash;
use crate::state::{exec_commit_block, AppResponses, BlockExecutor, ExecError, State, StateStore};
use crate::storage::{BlockStore, StoreError};
use crate::types::{Height, ParamsError, Validator, ValidatorSet, ValidatorSetError, ValidatorUpdate};

impl ConsensusState {
    /*
        Re-applies every WAL entry written after the end of the previous
        height. The log must not already close `height`: that would mean
        the block store and chain state are behind the log.
    */
    pub(super) fn catchup_replay(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.wal.search_for_end_height(height)?.is_some() {
            return Err(ConsensusError::Replay(format!(
                "wal already contains end of height {}",
                height
            )));
        }

        let marker = if height == self.state.initial_height { 0 } else { height - 1 };
        let Some(entries) = self.wal.search_for_end_height(marker)? else {
            warn!(height, marker, "no end height marker in wal, nothing to replay");
            return Ok(());
        };

        info!(height, "replaying wal");
        self.replay_mode = true;
        let mut replayed = 0usize;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.is_data_corruption() => {
                    warn!(height, err = %e, "damaged wal tail, stopping replay");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            self.replay_entry(entry)?;
            replayed += 1;
        }
        info!(height, replayed, step = %self.rs.summary(), "wal replay finished");
        Ok(())
    }

    fn replay_entry(&mut self, entry: TimedWalMessage) -> Result<(), ConsensusError> {
        self.now = entry.time;
        match entry.msg {
            WalMessage::MsgInfo(mi) => self.handle_msg(mi)?,
            WalMessage::Timeout(ti) => self.handle_timeout(ti)?,
            WalMessage::TxsAvailable => self.handle_txs_available()?,
            WalMessage::EndHeight(h) => debug!(height = h, "skipping end height marker"),
        }
        self.process_internal()
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("application height {app} is ahead of block store height {store}")]
    AppAhead { app: Height, store: Height },

    #[error("block store height {store} is inconsistent with state height {state}")]
    Inconsistent { store: Height, state: Height },

    #[error("app hash mismatch after height {height}: app {app}, state {state}")]
    AppHashMismatch {
        height: Height,
        app: String,
        state: String,
    },

    #[error("block {0} missing from block store")]
    MissingBlock(Height),

    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("init chain returned invalid validators: {0}")]
    Validators(#[from] ValidatorSetError),

    #[error("init chain returned invalid consensus params: {0}")]
    Params(#[from] ParamsError),
}

/*
    Reconciles three heights on start:

        S  last block in the block store
        T  last block reflected in the saved chain state
        A  last block the application committed

    S is T or T + 1 (a crash between saving a block and saving the state).
    The application may lag anywhere behind S; blocks it missed are
    re-executed on it. If the application already committed S but the state
    did not, the state is rebuilt from the saved responses without touching
    the application again.
*/
pub struct Handshaker {
    state_store: StateStore,
    block_store: BlockStore,
    blocks_replayed: usize,
}

impl Handshaker {
    pub fn new(state_store: StateStore, block_store: BlockStore) -> Self {
        Handshaker {
            state_store,
            block_store,
            blocks_replayed: 0,
        }
    }

    /// Blocks executed on the application by the last handshake.
    pub fn blocks_replayed(&self) -> usize {
        self.blocks_replayed
    }

    pub fn handshake(&mut self, state: State, executor: &mut BlockExecutor) -> Result<State, HandshakeError> {
        let ResponseInfo {
            last_block_height: app_height,
            last_block_app_hash: app_hash,
        } = executor.app_mut().info()?;
        info!(app_height, app_hash = %hex::encode(&app_hash[..6]), "handshake with application");

        self.blocks_replayed = 0;
        let state = self.replay_blocks(state, executor, app_height, app_hash)?;
        info!(
            height = state.last_block_height,
            replayed = self.blocks_replayed,
            app_hash = %hex::encode(&state.app_hash[..6]),
            "handshake complete"
        );
        Ok(state)
    }

    fn replay_blocks(
        &mut self,
        mut state: State,
        executor: &mut BlockExecutor,
        app_height: Height,
        mut app_hash: Hash,
    ) -> Result<State, HandshakeError> {
        if app_height == 0 {
            state = self.init_chain(state, executor)?;
        }

        let store_height = self.block_store.height()?;
        let state_height = state.last_block_height;

        if store_height < state.initial_height {
            return check_app_hash(state, app_hash);
        }
        if app_height > store_height {
            return Err(HandshakeError::AppAhead {
                app: app_height,
                store: store_height,
            });
        }
        if store_height < state_height || store_height > state_height + 1 {
            return Err(HandshakeError::Inconsistent {
                store: store_height,
                state: state_height,
            });
        }

        if store_height == state_height {
            if app_height < store_height {
                app_hash = self.replay_on_app(executor, &state, app_height + 1, store_height)?;
            }
            return check_app_hash(state, app_hash);
        }

        // the state is one block behind the store
        if app_height < state_height {
            self.replay_on_app(executor, &state, app_height + 1, state_height)?;
        }
        let state = if app_height <= state_height {
            info!(height = store_height, "applying last stored block");
            self.apply_stored_block(state, executor, store_height)?
        } else {
            info!(height = store_height, "rebuilding state from saved app responses");
            let responses = self.state_store.load_app_responses(store_height)?;
            let mut replay = executor.with_app(Box::new(ReplayApp::new(responses, app_hash)));
            self.apply_stored_block(state, &mut replay, store_height)?
        };
        let app_hash = state.app_hash;
        check_app_hash(state, app_hash)
    }

    fn init_chain(&mut self, mut state: State, executor: &mut BlockExecutor) -> Result<State, HandshakeError> {
        let validators = state
            .validators
            .validators()
            .iter()
            .map(|v| ValidatorUpdate {
                pub_key: v.pub_key.clone(),
                power: v.voting_power,
            })
            .collect();
        let ResponseInitChain {
            validators,
            consensus_params,
        } = executor.app_mut().init_chain(RequestInitChain {
            chain_id: state.chain_id.clone(),
            validators,
            consensus_params: state.consensus_params,
        })?;

        if state.last_block_height >= state.initial_height {
            // the app lost its state; the chain keeps its own validators
            return Ok(state);
        }
        if !validators.is_empty() {
            let set = validators
                .into_iter()
                .map(|u| Validator::new(u.pub_key, u.power))
                .collect();
            state.validators = ValidatorSet::new(set)?;
            info!(validators = state.validators.size(), "application replaced genesis validators");
        }
        if let Some(update) = consensus_params {
            let params = state.consensus_params.update(&update);
            params.validate()?;
            state.consensus_params = params;
        }
        self.state_store.save(&state)?;
        Ok(state)
    }

    /// Executes stored blocks `from..=to` on the application only.
    fn replay_on_app(
        &mut self,
        executor: &mut BlockExecutor,
        state: &State,
        from: Height,
        to: Height,
    ) -> Result<Hash, HandshakeError> {
        let mut app_hash = [0u8; 32];
        for height in from.max(state.initial_height)..=to {
            let block = self
                .block_store
                .load_block(height)?
                .ok_or(HandshakeError::MissingBlock(height))?;
            let last_validators = if height > state.initial_height {
                self.state_store.load_validators(height - 1)?
            } else {
                ValidatorSet::default()
            };
            app_hash = exec_commit_block(executor.app_mut(), &block, &last_validators)?;
            self.blocks_replayed += 1;
        }
        Ok(app_hash)
    }

    fn apply_stored_block(
        &mut self,
        state: State,
        executor: &mut BlockExecutor,
        height: Height,
    ) -> Result<State, HandshakeError> {
        let block = self
            .block_store
            .load_block(height)?
            .ok_or(HandshakeError::MissingBlock(height))?;
        let meta = self
            .block_store
            .load_block_meta(height)?
            .ok_or(HandshakeError::MissingBlock(height))?;
        let next = executor.apply_block(&state, &meta.block_id, &block)?;
        self.blocks_replayed += 1;
        Ok(next)
    }
}

fn check_app_hash(state: State, app_hash: Hash) -> Result<State, HandshakeError> {
    if app_hash != state.app_hash {
        return Err(HandshakeError::AppHashMismatch {
            height: state.last_block_height,
            app: hex::encode(app_hash),
            state: hex::encode(state.app_hash),
        });
    }
    Ok(state)
}

/// Plays back the responses saved for a block the application already
/// committed.
struct ReplayApp {
    responses: AppResponses,
    app_hash: Hash,
    next_tx: usize,
}

impl ReplayApp {
    fn new(responses: AppResponses, app_hash: Hash) -> Self {
        ReplayApp {
            responses,
            app_hash,
            next_tx: 0,
        }
    }
}

impl AppConnection for ReplayApp {
    fn info(&mut self) -> Result<ResponseInfo, AppError> {
        Ok(ResponseInfo::default())
    }

    fn init_chain(&mut self, _req: RequestInitChain) -> Result<ResponseInitChain, AppError> {
        Ok(ResponseInitChain::default())
    }

    fn begin_block(&mut self, _req: RequestBeginBlock) -> Result<(), AppError> {
        Ok(())
    }

    fn deliver_tx(&mut self, _tx: &[u8]) -> Result<ResponseDeliverTx, AppError> {
        let res = self
            .responses
            .deliver_txs
            .get(self.next_tx)
            .cloned()
            .ok_or_else(|| AppError::Internal("more transactions than saved responses".to_string()))?;
        self.next_tx += 1;
        Ok(res)
    }

    fn end_block(&mut self, _height: Height) -> Result<ResponseEndBlock, AppError> {
        Ok(self.responses.end_block.clone())
    }

    fn commit(&mut self) -> Result<ResponseCommit, AppError> {
        Ok(ResponseCommit {
            app_hash: self.app_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::app::KvStoreApp;
    use crate::evidence::MemEvidencePool;
    use crate::mempool::MemTxPool;
    use crate::state::test_helpers::*;
    use crate::storage::MemDb;
    use crate::types::{Commit, Timestamp, BLOCK_PART_SIZE};

    struct Chain {
        state_store: StateStore,
        block_store: BlockStore,
        states: Vec<State>,
        app: KvStoreApp,
    }

    fn executor(store: &StateStore, app: KvStoreApp) -> BlockExecutor {
        BlockExecutor::new(
            store.clone(),
            Box::new(app),
            Arc::new(MemTxPool::new(100, 1024)),
            Arc::new(MemEvidencePool::new(CHAIN_ID, 100)),
        )
    }

    /// A single-validator chain of `n` blocks, each carrying one tx.
    fn chain(n: Height) -> Chain {
        let keys = keypairs(1);
        let genesis_state = State::from_genesis(&genesis(&keys, &[1], 1)).unwrap();
        let state_store = StateStore::new(Arc::new(MemDb::new()));
        let block_store = BlockStore::new(Arc::new(MemDb::new()));
        state_store.save(&genesis_state).unwrap();

        let app = KvStoreApp::new();
        let mut exec = executor(&state_store, app.clone());
        let mut states = vec![genesis_state];
        let mut last_commit = Commit::default();
        for height in 1..=n {
            let state = states.last().unwrap().clone();
            let proposer = state.validators.proposer().unwrap().address;
            let tx = format!("k{}=v{}", height, height).into_bytes();
            let time = Timestamp(2_000 + height as u64 * 1_000);
            let block = state.make_block(height, vec![tx], last_commit, Vec::new(), proposer, time);
            let block_id = block.block_id(BLOCK_PART_SIZE).unwrap();
            let commit = signed_commit(&state, &keys, block_id, height);
            block_store.save_block(&block, &block_id, &commit).unwrap();
            states.push(exec.apply_block(&state, &block_id, &block).unwrap());
            last_commit = commit;
        }
        Chain {
            state_store,
            block_store,
            states,
            app,
        }
    }

    fn handshaker(chain: &Chain) -> Handshaker {
        Handshaker::new(chain.state_store.clone(), chain.block_store.clone())
    }

    #[test]
    fn test_replays_blocks_on_fresh_app() {
        let chain = chain(3);
        let fresh = KvStoreApp::new();
        let mut exec = executor(&chain.state_store, fresh.clone());
        let mut hs = handshaker(&chain);

        let state = hs.handshake(chain.states[3].clone(), &mut exec).unwrap();
        assert_eq!(state, chain.states[3]);
        assert_eq!(hs.blocks_replayed(), 3);
        assert_eq!(fresh.commit_calls(), 3);
        assert_eq!(fresh.get(b"k2"), Some(b"v2".to_vec()));

        // a second handshake finds everything level
        let again = hs.handshake(state.clone(), &mut exec).unwrap();
        assert_eq!(again, state);
        assert_eq!(hs.blocks_replayed(), 0);
        assert_eq!(fresh.commit_calls(), 3);
        assert_eq!(fresh.deliver_tx_calls(), 3);
    }

    #[test]
    fn test_applies_block_saved_before_state() {
        let chain = chain(3);
        chain.state_store.save(&chain.states[2]).unwrap();

        // an app that committed only the first two blocks
        let lagging = KvStoreApp::new();
        let mut exec = executor(&chain.state_store, lagging.clone());
        for height in 1..=2 {
            let block = chain.block_store.load_block(height).unwrap().unwrap();
            let last_validators = if height > 1 {
                chain.state_store.load_validators(height - 1).unwrap()
            } else {
                ValidatorSet::default()
            };
            exec_commit_block(exec.app_mut(), &block, &last_validators).unwrap();
        }

        let state = handshaker(&chain).handshake(chain.states[2].clone(), &mut exec).unwrap();
        assert_eq!(state, chain.states[3]);
        assert_eq!(lagging.commit_calls(), 3);
        assert_eq!(chain.state_store.load().unwrap(), Some(chain.states[3].clone()));
    }

    #[test]
    fn test_rebuilds_state_from_saved_responses() {
        let chain = chain(3);
        chain.state_store.save(&chain.states[2]).unwrap();

        let mut exec = executor(&chain.state_store, chain.app.clone());
        let state = handshaker(&chain).handshake(chain.states[2].clone(), &mut exec).unwrap();
        assert_eq!(state, chain.states[3]);
        assert_eq!(chain.app.commit_calls(), 3);
    }

    #[test]
    fn test_app_ahead_of_store_is_fatal() {
        let ahead = chain(3);
        let chain = chain(2);
        let mut exec = executor(&chain.state_store, ahead.app.clone());
        let result = handshaker(&chain).handshake(chain.states[2].clone(), &mut exec);
        assert!(matches!(result, Err(HandshakeError::AppAhead { app: 3, store: 2 })));
    }

    #[test]
    fn test_genesis_handshake_saves_state() {
        let keys = keypairs(2);
        let state = State::from_genesis(&genesis(&keys, &[1, 1], 1)).unwrap();
        let state_store = StateStore::new(Arc::new(MemDb::new()));
        let block_store = BlockStore::new(Arc::new(MemDb::new()));
        let mut exec = executor(&state_store, KvStoreApp::new());

        let mut hs = Handshaker::new(state_store.clone(), block_store);
        let result = hs.handshake(state.clone(), &mut exec).unwrap();
        assert_eq!(result, state);
        assert_eq!(state_store.load().unwrap(), Some(state));
    }
}
