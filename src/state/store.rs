use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::State;
use crate::app::{ResponseDeliverTx, ResponseEndBlock};
use crate::common::{crypto::Hash, merkle};
use crate::storage::{KvStore, StoreError};
use crate::types::{decode, encode, ConsensusParams, Height, ValidatorSet};

const STATE_KEY: &str = "stateKey";

fn validators_key(height: Height) -> String {
    format!("validatorsKey:{}", height)
}

fn consensus_params_key(height: Height) -> String {
    format!("consensusParamsKey:{}", height)
}

fn app_responses_key(height: Height) -> String {
    format!("appResponsesKey:{}", height)
}

/// Deterministic outputs of executing one block, saved before commit so the
/// state can be rebuilt without running the application again.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct AppResponses {
    pub deliver_txs: Vec<ResponseDeliverTx>,
    pub end_block: ResponseEndBlock,
}

impl AppResponses {
    /// Merkle root over the (code, data) of every transaction result.
    pub fn results_hash(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self
            .deliver_txs
            .iter()
            .map(|r| {
                let mut leaf = r.code.to_be_bytes().to_vec();
                leaf.extend_from_slice(&r.data);
                leaf
            })
            .collect();
        merkle::root(&leaves)
    }
}

/*
    The set is stored in full only at the height it changed; every other
    height stores a pointer to that height. Loading a pointer replays the
    per-height proposer-priority increments since the change.
*/
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
struct ValidatorsInfo {
    validator_set: Option<ValidatorSet>,
    last_height_changed: Height,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
struct ConsensusParamsInfo {
    consensus_params: Option<ConsensusParams>,
    last_height_changed: Height,
}

#[derive(Clone)]
pub struct StateStore {
    db: Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(db: Arc<dyn KvStore>) -> Self {
        StateStore { db }
    }

    pub fn load(&self) -> Result<Option<State>, StoreError> {
        match self.db.get(STATE_KEY)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persists the state and the validator/parameter records for the next height.
    pub fn save(&self, state: &State) -> Result<(), StoreError> {
        let next_height = state.last_block_height + 1;
        // The validators for the first height are recorded explicitly too.
        if next_height == state.initial_height {
            self.save_validators_info(next_height, next_height, &state.validators)?;
        }
        self.save_validators_info(
            next_height,
            state.last_height_validators_changed,
            &state.validators,
        )?;
        self.save_consensus_params_info(
            next_height,
            state.last_height_consensus_params_changed,
            &state.consensus_params,
        )?;
        self.db.set_sync(STATE_KEY, &encode(state)?)?;
        Ok(())
    }

    fn save_validators_info(
        &self,
        height: Height,
        last_height_changed: Height,
        set: &ValidatorSet,
    ) -> Result<(), StoreError> {
        let info = ValidatorsInfo {
            validator_set: (height == last_height_changed).then(|| set.clone()),
            last_height_changed,
        };
        self.db.set_sync(&validators_key(height), &encode(&info)?)
    }

    fn save_consensus_params_info(
        &self,
        height: Height,
        last_height_changed: Height,
        params: &ConsensusParams,
    ) -> Result<(), StoreError> {
        let info = ConsensusParamsInfo {
            consensus_params: (height == last_height_changed).then_some(*params),
            last_height_changed,
        };
        self.db.set_sync(&consensus_params_key(height), &encode(&info)?)
    }

    fn load_validators_info(&self, height: Height) -> Result<ValidatorsInfo, StoreError> {
        match self.db.get(&validators_key(height))? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(StoreError::Missing(format!("validators at height {}", height))),
        }
    }

    /// The validator set that signs `height`.
    pub fn load_validators(&self, height: Height) -> Result<ValidatorSet, StoreError> {
        let info = self.load_validators_info(height)?;
        if let Some(set) = info.validator_set {
            return Ok(set);
        }
        let changed = self.load_validators_info(info.last_height_changed)?;
        let set = changed.validator_set.ok_or_else(|| {
            StoreError::Missing(format!(
                "validator set at change height {}",
                info.last_height_changed
            ))
        })?;
        let increments = (height - info.last_height_changed).max(0) as u32;
        Ok(set.advanced(increments))
    }

    pub fn load_consensus_params(&self, height: Height) -> Result<ConsensusParams, StoreError> {
        let load = |h: Height| -> Result<ConsensusParamsInfo, StoreError> {
            match self.db.get(&consensus_params_key(h))? {
                Some(bytes) => Ok(decode(&bytes)?),
                None => Err(StoreError::Missing(format!("consensus params at height {}", h))),
            }
        };
        let info = load(height)?;
        if let Some(params) = info.consensus_params {
            return Ok(params);
        }
        load(info.last_height_changed)?.consensus_params.ok_or_else(|| {
            StoreError::Missing(format!(
                "consensus params at change height {}",
                info.last_height_changed
            ))
        })
    }

    pub fn save_app_responses(&self, height: Height, responses: &AppResponses) -> Result<(), StoreError> {
        self.db.set_sync(&app_responses_key(height), &encode(responses)?)
    }

    pub fn load_app_responses(&self, height: Height) -> Result<AppResponses, StoreError> {
        match self.db.get(&app_responses_key(height))? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Err(StoreError::Missing(format!("app responses at height {}", height))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_helpers::*;
    use crate::storage::MemDb;
    use crate::types::ValidatorUpdate;

    #[test]
    fn test_save_and_load_state() {
        let keys = keypairs(3);
        let state = State::from_genesis(&genesis(&keys, &[1, 1, 1], 1)).unwrap();
        let store = StateStore::new(Arc::new(MemDb::new()));
        assert!(store.load().unwrap().is_none());

        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state.clone()));
        assert_eq!(store.load_validators(1).unwrap(), state.validators);
        assert_eq!(store.load_consensus_params(1).unwrap(), state.consensus_params);
    }

    #[test]
    fn test_validators_pointer_replays_increments() {
        let keys = keypairs(3);
        let mut state = State::from_genesis(&genesis(&keys, &[1, 2, 3], 1)).unwrap();
        let store = StateStore::new(Arc::new(MemDb::new()));
        store.save(&state).unwrap();

        // three heights without changes
        for _ in 0..3 {
            state.last_block_height += 1;
            state.last_validators = state.validators.clone();
            state.validators.increment_proposer_priority(1);
            store.save(&state).unwrap();
        }
        assert_eq!(store.load_validators(4).unwrap(), state.validators);

        // a change takes effect at the following height
        state.last_block_height += 1;
        state
            .validators
            .apply_updates(&[ValidatorUpdate { pub_key: keys[0].pubkey(), power: 0 }])
            .unwrap();
        state.validators.increment_proposer_priority(1);
        state.last_height_validators_changed = state.last_block_height + 1;
        store.save(&state).unwrap();
        assert_eq!(store.load_validators(5).unwrap().size(), 2);
        assert_eq!(store.load_validators(4).unwrap().size(), 3);
    }

    #[test]
    fn test_results_hash_covers_code_and_data() {
        let ok = AppResponses {
            deliver_txs: vec![ResponseDeliverTx::default()],
            ..AppResponses::default()
        };
        let failed = AppResponses {
            deliver_txs: vec![ResponseDeliverTx {
                code: 1,
                ..ResponseDeliverTx::default()
            }],
            ..AppResponses::default()
        };
        assert_ne!(ok.results_hash(), failed.results_hash());
    }
}
