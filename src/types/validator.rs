use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};
use thiserror::Error;

use super::{BlockId, Commit, Hashable, Height, VoteType};
use crate::common::crypto::{Address, Hash, PublicKey};

/// Upper bound on the summed voting power of a set, so that priority
/// arithmetic (which adds and subtracts up to twice the total) cannot overflow.
pub const MAX_TOTAL_VOTING_POWER: i64 = i64::MAX / 8;

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKey,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: i64) -> Self {
        Validator {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Higher priority wins; ties go to the lower address.
    fn compare_priority(&self, other: &Validator) -> Ordering {
        self.proposer_priority
            .cmp(&other.proposer_priority)
            .then_with(|| other.address.cmp(&self.address))
    }
}

/// A validator-set change returned by the application at end of block.
/// Power zero removes the validator.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    pub pub_key: PublicKey,
    pub power: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,

    #[error("duplicate validator {0}")]
    Duplicate(Address),

    #[error("validator {0} has negative voting power {1}")]
    NegativePower(Address, i64),

    #[error("total voting power {0} exceeds maximum {MAX_TOTAL_VOTING_POWER}")]
    TotalPowerOverflow(i128),

    #[error("cannot remove unknown validator {0}")]
    UnknownValidator(Address),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitError {
    #[error("commit has {got} precommits, validator set has {want}")]
    WrongSize { got: usize, want: usize },

    #[error("commit is for block {got}, expected {want}")]
    WrongBlock { got: String, want: String },

    #[error("invalid precommit at index {index}: {reason}")]
    InvalidPrecommit { index: usize, reason: String },

    #[error("insufficient voting power: got {got}, needed more than {needed}")]
    InsufficientPower { got: i64, needed: i64 },
}

/*
    Voting-power-weighted validator set, kept sorted by address. The proposer
    for a round is chosen by weighted round-robin: every increment adds each
    validator's power to its priority, the highest priority proposes and pays
    back the total power.
*/
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Address>,
    total_voting_power: i64,
}

impl ValidatorSet {
    /// Builds a set and advances priorities once so the first proposer is known.
    pub fn new(validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        let mut set = ValidatorSet {
            validators,
            proposer: None,
            total_voting_power: 0,
        };
        set.validators.sort_by(|a, b| a.address.cmp(&b.address));
        set.check()?;
        set.increment_proposer_priority(1);
        Ok(set)
    }

    fn check(&mut self) -> Result<(), ValidatorSetError> {
        if self.validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let mut total: i128 = 0;
        for (i, val) in self.validators.iter().enumerate() {
            if val.voting_power < 0 {
                return Err(ValidatorSetError::NegativePower(val.address, val.voting_power));
            }
            if i > 0 && self.validators[i - 1].address == val.address {
                return Err(ValidatorSetError::Duplicate(val.address));
            }
            total += val.voting_power as i128;
        }
        if total > MAX_TOTAL_VOTING_POWER as i128 {
            return Err(ValidatorSetError::TotalPowerOverflow(total));
        }
        self.total_voting_power = total as i64;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    /// Power that must be strictly exceeded for a quorum.
    pub fn two_thirds_threshold(&self) -> i64 {
        self.total_voting_power * 2 / 3
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|i| (i, &self.validators[i]))
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn increment_proposer_priority(&mut self, times: u32) {
        if self.validators.is_empty() || times == 0 {
            return;
        }
        for _ in 0..times {
            self.increment_once();
        }
    }

    fn increment_once(&mut self) {
        let total = self.total_voting_power;
        for val in self.validators.iter_mut() {
            val.proposer_priority = val.proposer_priority.saturating_add(val.voting_power);
        }
        let mut best = 0;
        for (j, val) in self.validators.iter().enumerate() {
            if val.compare_priority(&self.validators[best]) == Ordering::Greater {
                best = j;
            }
        }
        let winner = &mut self.validators[best];
        winner.proposer_priority = winner.proposer_priority.saturating_sub(total);
        self.proposer = Some(winner.address);
    }

    pub fn proposer(&self) -> Option<&Validator> {
        match self.proposer {
            Some(address) => self.get_by_address(&address).map(|(_, v)| v),
            None => self
                .validators
                .iter()
                .max_by(|a, b| a.compare_priority(b)),
        }
    }

    /// Copy of this set advanced `rounds` times.
    pub fn advanced(&self, rounds: u32) -> ValidatorSet {
        let mut copy = self.clone();
        copy.increment_proposer_priority(rounds);
        copy
    }

    /// Applies end-of-block updates. New validators start behind everyone
    /// else so they cannot propose immediately.
    pub fn apply_updates(&mut self, updates: &[ValidatorUpdate]) -> Result<(), ValidatorSetError> {
        let mut next = self.validators.clone();
        for update in updates {
            let address = update.pub_key.address();
            if update.power < 0 {
                return Err(ValidatorSetError::NegativePower(address, update.power));
            }
            let position = next.binary_search_by(|v| v.address.cmp(&address));
            match (position, update.power) {
                (Ok(i), 0) => {
                    next.remove(i);
                }
                (Err(_), 0) => return Err(ValidatorSetError::UnknownValidator(address)),
                (Ok(i), power) => next[i].voting_power = power,
                (Err(i), power) => {
                    let mut val = Validator::new(update.pub_key, power);
                    let total = self.total_voting_power;
                    val.proposer_priority = -(total.saturating_add(total / 8));
                    next.insert(i, val);
                }
            }
        }
        let mut updated = ValidatorSet {
            validators: next,
            proposer: None,
            total_voting_power: 0,
        };
        updated.check()?;
        *self = updated;
        Ok(())
    }

    /// Verifies that `commit` carries more than 2/3 of this set's power
    /// in valid precommits for `block_id` at `height`.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CommitError> {
        if commit.size() != self.size() {
            return Err(CommitError::WrongSize {
                got: commit.size(),
                want: self.size(),
            });
        }
        if &commit.block_id != block_id {
            return Err(CommitError::WrongBlock {
                got: commit.block_id.short(),
                want: block_id.short(),
            });
        }
        let round = commit.round();
        let mut tallied: i64 = 0;
        for (index, precommit) in commit.precommits.iter().enumerate() {
            let Some(precommit) = precommit else { continue };
            let invalid = |reason: &str| CommitError::InvalidPrecommit {
                index,
                reason: reason.to_string(),
            };
            if precommit.height != height {
                return Err(invalid("wrong height"));
            }
            if precommit.round != round {
                return Err(invalid("wrong round"));
            }
            if precommit.vote_type != VoteType::Precommit {
                return Err(invalid("not a precommit"));
            }
            let val = &self.validators[index];
            if !precommit.verify(chain_id, &val.pub_key) {
                return Err(invalid("bad signature"));
            }
            if &precommit.block_id == block_id {
                tallied += val.voting_power;
            }
        }
        let needed = self.two_thirds_threshold();
        if tallied > needed {
            Ok(())
        } else {
            Err(CommitError::InsufficientPower { got: tallied, needed })
        }
    }
}

impl Hashable for ValidatorSet {
    /// Covers membership and power only, not priorities.
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        for val in &self.validators {
            hasher.update(val.pub_key.key);
            hasher.update(val.voting_power.to_be_bytes());
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Keypair;

    fn make_set(powers: &[i64]) -> ValidatorSet {
        let vals = powers
            .iter()
            .enumerate()
            .map(|(i, p)| Validator::new(Keypair::from_seed(&[i as u8 + 1; 32]).pubkey(), *p))
            .collect();
        ValidatorSet::new(vals).unwrap()
    }

    #[test]
    fn test_equal_power_round_robin() {
        let mut set = make_set(&[1, 1, 1, 1]);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(set.proposer().unwrap().address);
            set.increment_proposer_priority(1);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4, "every validator proposes once in four rounds");
    }

    #[test]
    fn test_weighted_proposer_frequency() {
        let mut set = make_set(&[1, 2, 7]);
        let heavy = set
            .validators()
            .iter()
            .find(|v| v.voting_power == 7)
            .unwrap()
            .address;
        let mut count = 0;
        for _ in 0..100 {
            if set.proposer().unwrap().address == heavy {
                count += 1;
            }
            set.increment_proposer_priority(1);
        }
        assert_eq!(count, 70);
    }

    #[test]
    fn test_proposer_is_deterministic() {
        let a = make_set(&[3, 1, 4, 1]).advanced(5);
        let b = make_set(&[3, 1, 4, 1]).advanced(2).advanced(3);
        assert_eq!(a.proposer(), b.proposer());
    }

    #[test]
    fn test_rejects_power_overflow() {
        let vals = vec![
            Validator::new(Keypair::from_seed(&[1; 32]).pubkey(), MAX_TOTAL_VOTING_POWER),
            Validator::new(Keypair::from_seed(&[2; 32]).pubkey(), 1),
        ];
        assert!(matches!(
            ValidatorSet::new(vals),
            Err(ValidatorSetError::TotalPowerOverflow(_))
        ));
    }

    #[test]
    fn test_apply_updates() {
        let mut set = make_set(&[1, 1, 1]);
        let removed = Keypair::from_seed(&[1; 32]).pubkey();
        let added = Keypair::from_seed(&[9; 32]).pubkey();
        set.apply_updates(&[
            ValidatorUpdate { pub_key: removed, power: 0 },
            ValidatorUpdate { pub_key: added, power: 5 },
        ])
        .unwrap();
        assert_eq!(set.size(), 3);
        assert!(!set.has_address(&removed.address()));
        assert_eq!(set.total_voting_power(), 7);

        let unknown = Keypair::from_seed(&[42; 32]).pubkey();
        assert_eq!(
            set.apply_updates(&[ValidatorUpdate { pub_key: unknown, power: 0 }]),
            Err(ValidatorSetError::UnknownValidator(unknown.address()))
        );
    }
}
