use std::fmt;

use serde::{Deserialize, Serialize};

use super::{BlockId, Height, Round, Timestamp};
use crate::common::{
    bits::BitArray,
    crypto::{Address, Hash, PublicKey, Signature},
    merkle,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    fn as_byte(&self) -> u8 {
        match self {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

fn put_chain_id(out: &mut Vec<u8>, chain_id: &str) {
    out.extend_from_slice(&(chain_id.len() as u64).to_be_bytes());
    out.extend_from_slice(chain_id.as_bytes());
}

fn put_block_id(out: &mut Vec<u8>, block_id: &BlockId) {
    out.extend_from_slice(&block_id.hash);
    out.extend_from_slice(&block_id.parts.total.to_be_bytes());
    out.extend_from_slice(&block_id.parts.hash);
}

/// A signed prevote or precommit. Immutable once signed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub validator_address: Address,
    pub validator_index: u32,
    pub height: Height,
    pub round: Round,
    pub timestamp: Timestamp,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub signature: Signature,
}

impl Vote {
    /// Canonical bytes covered by the signature.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(b'V');
        put_chain_id(&mut out, chain_id);
        out.push(self.vote_type.as_byte());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.round.to_be_bytes());
        put_block_id(&mut out, &self.block_id);
        out.extend_from_slice(&self.timestamp.0.to_be_bytes());
        out
    }

    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> bool {
        pub_key.address() == self.validator_address
            && pub_key.verify(&self.sign_bytes(chain_id), &self.signature)
    }
}

impl fmt::Debug for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{}:{:?} {}/{:02}/{} {} @ {:?}}}",
            self.validator_index,
            self.validator_address,
            self.height,
            self.round,
            self.vote_type,
            self.block_id.short(),
            self.timestamp,
        )
    }
}

/// A proposer's signed statement of the block it proposes for (height, round).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    /// Round of the prevote quorum justifying this block, or -1.
    pub pol_round: Round,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl Proposal {
    pub fn new(height: Height, round: Round, pol_round: Round, block_id: BlockId, timestamp: Timestamp) -> Self {
        Proposal {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature: Signature::empty(),
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(b'P');
        put_chain_id(&mut out, chain_id);
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.round.to_be_bytes());
        out.extend_from_slice(&self.pol_round.to_be_bytes());
        put_block_id(&mut out, &self.block_id);
        out.extend_from_slice(&self.timestamp.0.to_be_bytes());
        out
    }

    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> bool {
        pub_key.verify(&self.sign_bytes(chain_id), &self.signature)
    }
}

impl fmt::Debug for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} ({}, pol {}) @ {:?}}}",
            self.height,
            self.round,
            self.block_id.short(),
            self.pol_round,
            self.timestamp
        )
    }
}

/*
    A commit is the canonical quorum of precommits for one block at a given
    (height, round). Precommits are indexed by validator index; absent
    validators leave a hole.
*/
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.precommits.iter().all(|p| p.is_none())
    }

    fn first_precommit(&self) -> Option<&Vote> {
        self.precommits.iter().flatten().next()
    }

    pub fn height(&self) -> Height {
        self.first_precommit().map(|v| v.height).unwrap_or(0)
    }

    pub fn round(&self) -> Round {
        self.first_precommit().map(|v| v.round).unwrap_or(-1)
    }

    pub fn size(&self) -> usize {
        self.precommits.len()
    }

    pub fn bit_array(&self) -> BitArray {
        let mut bits = BitArray::new(self.precommits.len());
        for (i, p) in self.precommits.iter().enumerate() {
            bits.set(i, p.is_some());
        }
        bits
    }

    pub fn hash(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self
            .precommits
            .iter()
            .map(|p| match p {
                Some(vote) => {
                    let mut bytes = vote.sign_bytes("");
                    bytes.extend_from_slice(&vote.signature.sig);
                    bytes
                }
                None => Vec::new(),
            })
            .collect();
        merkle::root(&leaves)
    }

    /// Structural checks that do not need the validator set.
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.block_id.is_nil() {
            return Err("commit cannot be for nil block".to_string());
        }
        let height = self.height();
        let round = self.round();
        for p in self.precommits.iter().flatten() {
            if p.vote_type != VoteType::Precommit {
                return Err(format!("invalid commit vote type {}", p.vote_type));
            }
            if p.height != height || p.round != round {
                return Err(format!(
                    "precommit at {}/{} does not match commit {}/{}",
                    p.height, p.round, height, round
                ));
            }
        }
        Ok(())
    }
}
