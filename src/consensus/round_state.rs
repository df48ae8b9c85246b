use std::fmt;

use serde::{Deserialize, Serialize};

use super::height_vote_set::HeightVoteSet;
use super::vote_set::VoteSet;
use crate::types::{Block, BlockId, Hashable, Height, PartSet, Proposal, Round, Timestamp, ValidatorSet};

/// Sub-state within a round. Ordered: a step only moves forward within a
/// round.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum Step {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl Step {
    pub fn as_u8(&self) -> u8 {
        match self {
            Step::NewHeight => 1,
            Step::NewRound => 2,
            Step::Propose => 3,
            Step::Prevote => 4,
            Step::PrevoteWait => 5,
            Step::Precommit => 6,
            Step::PrecommitWait => 7,
            Step::Commit => 8,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        write!(f, "{}", name)
    }
}

/*
    Everything the state machine knows about the current height.

    locked_round/locked_block: the block this validator promised to
    precommit; moves only to a block seen with a prevote quorum in a later
    round, and clears at the next height.

    valid_round/valid_block: the latest round with a prevote quorum for a
    block, re-proposed by this node when it is the proposer.
*/
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub start_time: Timestamp,
    pub commit_time: Timestamp,

    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,

    pub locked_round: Round,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,

    pub valid_round: Round,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,

    pub votes: HeightVoteSet,
    pub commit_round: Round,
    pub last_commit: Option<VoteSet>,
    pub last_validators: ValidatorSet,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    pub fn new(chain_id: &str, height: Height, validators: ValidatorSet) -> Self {
        RoundState {
            height,
            round: 0,
            step: Step::NewHeight,
            start_time: Timestamp::default(),
            commit_time: Timestamp::default(),
            votes: HeightVoteSet::new(chain_id, height, validators.clone()),
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            valid_round: -1,
            valid_block: None,
            valid_block_parts: None,
            commit_round: -1,
            last_commit: None,
            last_validators: ValidatorSet::default(),
            triggered_timeout_precommit: false,
        }
    }

    pub fn locked_block_id(&self) -> Option<BlockId> {
        let block = self.locked_block.as_ref()?;
        let parts = self.locked_block_parts.as_ref()?;
        Some(BlockId {
            hash: block.hash(),
            parts: parts.header(),
        })
    }

    pub fn summary(&self) -> RoundStepSummary {
        RoundStepSummary {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }
}

/// Compact (height, round, step) used for logging and peer announcements.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct RoundStepSummary {
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

impl fmt::Display for RoundStepSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.step)
    }
}
