use std::collections::HashMap;

use thiserror::Error;

use crate::common::{bits::BitArray, crypto::Address};
use crate::network::PeerId;
use crate::types::{BlockId, Commit, Evidence, Height, Round, ValidatorSet, Vote, VoteType};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("vote {got_height}/{got_round}/{got_type} does not belong to set {height}/{round}/{vote_type}")]
    Unexpected {
        height: Height,
        round: Round,
        vote_type: VoteType,
        got_height: Height,
        got_round: Round,
        got_type: VoteType,
    },

    #[error("validator index {0} out of range")]
    InvalidIndex(u32),

    #[error("validator address {0:?} does not match index {1}")]
    InvalidAddress(Address, u32),

    #[error("invalid signature from {0:?}")]
    InvalidSignature(Address),

    #[error("conflicting votes from {:?}", .evidence.address())]
    Conflicting { evidence: Box<Evidence>, added: bool },

    #[error("peer {peer} already claimed a different 2/3 majority")]
    ConflictingPeerClaim { peer: PeerId },

    #[error("peer {0} sent votes for too many catch-up rounds")]
    TooManyCatchupRounds(PeerId),

    #[error("no vote set for round {0}")]
    UnknownRound(Round),
}

/// Votes for one block id within a vote set.
#[derive(Clone, PartialEq, Eq, Debug)]
struct BlockVotes {
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> Self {
        BlockVotes {
            peer_maj23,
            bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, power: i64) {
        let index = vote.validator_index as usize;
        if self.votes[index].is_none() {
            self.bit_array.set(index, true);
            self.votes[index] = Some(vote);
            self.sum += power;
        }
    }
}

/*
    VoteSet collects the votes of one (height, round, type).

    `votes` holds one canonical vote per validator: the first one seen, or
    the one for the 2/3 majority block once there is one. A second vote from
    the same validator for a different block is reported as evidence and is
    only tracked if some peer claimed a 2/3 majority for that block, so that
    a Byzantine validator cannot make us store unbounded votes.
*/
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,

    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
    maj23: Option<BlockId>,
    votes_by_block: HashMap<BlockId, BlockVotes>,
    peer_maj23s: HashMap<PeerId, BlockId>,
}

impl VoteSet {
    pub fn new(chain_id: &str, height: Height, round: Round, vote_type: VoteType, validators: ValidatorSet) -> Self {
        let size = validators.size();
        VoteSet {
            chain_id: chain_id.to_string(),
            height,
            round,
            vote_type,
            validators,
            votes_bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.validators.size()
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    /// Returns Ok(true) if the vote was added, Ok(false) for a duplicate.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteError> {
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type {
            return Err(VoteError::Unexpected {
                height: self.height,
                round: self.round,
                vote_type: self.vote_type,
                got_height: vote.height,
                got_round: vote.round,
                got_type: vote.vote_type,
            });
        }
        let index = vote.validator_index;
        let val = self
            .validators
            .get_by_index(index as usize)
            .ok_or(VoteError::InvalidIndex(index))?;
        if val.address != vote.validator_address {
            return Err(VoteError::InvalidAddress(vote.validator_address, index));
        }
        let pub_key = val.pub_key;
        let power = val.voting_power;

        if let Some(existing) = self.get_vote(index as usize, &vote.block_id) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
        }

        if !vote.verify(&self.chain_id, &pub_key) {
            return Err(VoteError::InvalidSignature(vote.validator_address));
        }

        let (added, conflicting) = self.add_verified_vote(vote.clone(), power);
        match conflicting {
            Some(existing) => Err(VoteError::Conflicting {
                evidence: Box::new(Evidence::DuplicateVote {
                    pub_key,
                    vote_a: Box::new(existing),
                    vote_b: Box::new(vote),
                }),
                added,
            }),
            None => Ok(added),
        }
    }

    fn get_vote(&self, index: usize, block_id: &BlockId) -> Option<&Vote> {
        if let Some(Some(existing)) = self.votes.get(index) {
            if &existing.block_id == block_id {
                return Some(existing);
            }
        }
        self.votes_by_block
            .get(block_id)
            .and_then(|bv| bv.votes.get(index))
            .and_then(|v| v.as_ref())
    }

    fn add_verified_vote(&mut self, vote: Vote, power: i64) -> (bool, Option<Vote>) {
        let index = vote.validator_index as usize;
        let block_id = vote.block_id;

        let mut conflicting = None;
        match self.votes[index].as_ref().map(|v| v.block_id) {
            Some(existing_id) => {
                if existing_id != block_id {
                    conflicting = self.votes[index].clone();
                }
                if self.maj23 == Some(block_id) {
                    self.votes[index] = Some(vote.clone());
                    self.votes_bit_array.set(index, true);
                }
            }
            None => {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set(index, true);
                self.sum += power;
            }
        }

        let claimed = self
            .votes_by_block
            .get(&block_id)
            .map(|bv| bv.peer_maj23)
            .unwrap_or(false);
        if conflicting.is_some() && !claimed {
            return (false, conflicting);
        }

        let size = self.validators.size();
        let threshold = self.validators.two_thirds_threshold();
        let block_votes = self
            .votes_by_block
            .entry(block_id)
            .or_insert_with(|| BlockVotes::new(false, size));
        let before = block_votes.sum;
        block_votes.add_verified_vote(vote, power);
        if before <= threshold && block_votes.sum > threshold && self.maj23.is_none() {
            self.maj23 = Some(block_id);
            let canonical = block_votes.votes.clone();
            for (i, v) in canonical.into_iter().enumerate() {
                if v.is_some() {
                    self.votes[i] = v;
                }
            }
        }
        (true, conflicting)
    }

    /// Records a peer's claim that `block_id` has 2/3 in this set, so that
    /// conflicting votes for it are tracked from now on.
    pub fn set_peer_maj23(&mut self, peer: &PeerId, block_id: BlockId) -> Result<(), VoteError> {
        if let Some(existing) = self.peer_maj23s.get(peer) {
            if existing == &block_id {
                return Ok(());
            }
            return Err(VoteError::ConflictingPeerClaim { peer: peer.clone() });
        }
        self.peer_maj23s.insert(peer.clone(), block_id);
        let size = self.validators.size();
        self.votes_by_block
            .entry(block_id)
            .and_modify(|bv| bv.peer_maj23 = true)
            .or_insert_with(|| BlockVotes::new(true, size));
        Ok(())
    }

    pub fn bit_array(&self) -> BitArray {
        self.votes_bit_array.clone()
    }

    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<BitArray> {
        self.votes_by_block.get(block_id).map(|bv| bv.bit_array.clone())
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(|v| v.as_ref())
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Vote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.get_by_index(index)
    }

    /// The block id (possibly nil) with more than 2/3 of the power, if any.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// More than 2/3 of the power voted, for anything.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum > self.validators.two_thirds_threshold()
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }

    /// The commit for the 2/3 majority block of a precommit set.
    pub fn make_commit(&self) -> Option<Commit> {
        if self.vote_type != VoteType::Precommit {
            return None;
        }
        let block_id = self.maj23.filter(|id| !id.is_nil())?;
        let block_votes = self.votes_by_block.get(&block_id)?;
        Some(Commit {
            block_id,
            precommits: block_votes.votes.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use crate::common::crypto::{Keypair, Signature};
    use crate::types::{PartSetHeader, Timestamp, Validator};

    pub fn validators(powers: &[i64]) -> (ValidatorSet, Vec<Keypair>) {
        let keys: Vec<Keypair> = (0..powers.len())
            .map(|i| Keypair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let vals = keys
            .iter()
            .zip(powers)
            .map(|(k, p)| Validator::new(k.pubkey(), *p))
            .collect();
        let set = ValidatorSet::new(vals).unwrap();
        // order keys like the set
        let ordered = set
            .validators()
            .iter()
            .map(|v| keys.iter().find(|k| k.pubkey() == v.pub_key).unwrap().clone())
            .collect();
        (set, ordered)
    }

    pub fn block_id(tag: u8) -> BlockId {
        BlockId {
            hash: [tag; 32],
            parts: PartSetHeader { total: 1, hash: [tag; 32] },
        }
    }

    pub fn signed_vote(
        chain_id: &str,
        key: &Keypair,
        index: usize,
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: BlockId,
    ) -> Vote {
        let mut vote = Vote {
            validator_address: key.pubkey().address(),
            validator_index: index as u32,
            height,
            round,
            timestamp: Timestamp(1_000 + index as u64),
            vote_type,
            block_id,
            signature: Signature::empty(),
        };
        vote.signature = key.sign(&vote.sign_bytes(chain_id));
        vote
    }
}
