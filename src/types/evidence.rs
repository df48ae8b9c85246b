use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};
use thiserror::Error;

use super::{Height, Proposal, Vote};
use crate::common::crypto::{Address, Hash, PublicKey};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvidenceError {
    #[error("evidence statements are for different height/round/type")]
    Mismatched,

    #[error("evidence statements are identical")]
    NotConflicting,

    #[error("evidence signature invalid")]
    InvalidSignature,
}

/// Provable misbehavior: two conflicting statements signed by one validator.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Evidence {
    DuplicateVote {
        pub_key: PublicKey,
        vote_a: Box<Vote>,
        vote_b: Box<Vote>,
    },
    ConflictingProposal {
        pub_key: PublicKey,
        proposal_a: Box<Proposal>,
        proposal_b: Box<Proposal>,
    },
}

impl Evidence {
    pub fn height(&self) -> Height {
        match self {
            Evidence::DuplicateVote { vote_a, .. } => vote_a.height,
            Evidence::ConflictingProposal { proposal_a, .. } => proposal_a.height,
        }
    }

    pub fn address(&self) -> Address {
        match self {
            Evidence::DuplicateVote { pub_key, .. } => pub_key.address(),
            Evidence::ConflictingProposal { pub_key, .. } => pub_key.address(),
        }
    }

    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        match self {
            Evidence::DuplicateVote { pub_key, vote_a, vote_b } => {
                hasher.update(b"dupvote");
                hasher.update(pub_key.key);
                hasher.update(vote_a.signature.sig);
                hasher.update(vote_b.signature.sig);
            }
            Evidence::ConflictingProposal {
                pub_key,
                proposal_a,
                proposal_b,
            } => {
                hasher.update(b"dupproposal");
                hasher.update(pub_key.key);
                hasher.update(proposal_a.signature.sig);
                hasher.update(proposal_b.signature.sig);
            }
        }
        hasher.finalize().into()
    }

    pub fn verify(&self, chain_id: &str) -> Result<(), EvidenceError> {
        match self {
            Evidence::DuplicateVote { pub_key, vote_a, vote_b } => {
                if vote_a.height != vote_b.height
                    || vote_a.round != vote_b.round
                    || vote_a.vote_type != vote_b.vote_type
                    || vote_a.validator_address != vote_b.validator_address
                {
                    return Err(EvidenceError::Mismatched);
                }
                if vote_a.block_id == vote_b.block_id {
                    return Err(EvidenceError::NotConflicting);
                }
                if !vote_a.verify(chain_id, pub_key) || !vote_b.verify(chain_id, pub_key) {
                    return Err(EvidenceError::InvalidSignature);
                }
                Ok(())
            }
            Evidence::ConflictingProposal {
                pub_key,
                proposal_a,
                proposal_b,
            } => {
                if proposal_a.height != proposal_b.height || proposal_a.round != proposal_b.round {
                    return Err(EvidenceError::Mismatched);
                }
                if proposal_a.block_id == proposal_b.block_id && proposal_a.pol_round == proposal_b.pol_round {
                    return Err(EvidenceError::NotConflicting);
                }
                if !proposal_a.verify(chain_id, pub_key) || !proposal_b.verify(chain_id, pub_key) {
                    return Err(EvidenceError::InvalidSignature);
                }
                Ok(())
            }
        }
    }
}
