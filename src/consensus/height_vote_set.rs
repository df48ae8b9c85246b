use std::collections::{BTreeMap, HashMap};

use super::vote_set::{VoteError, VoteSet};
use crate::network::PeerId;
use crate::types::{BlockId, Height, Round, ValidatorSet, Vote, VoteType};

/// Rounds beyond the current one a single peer may open with its votes.
const MAX_CATCHUP_ROUNDS: usize = 2;

#[derive(Clone, PartialEq, Eq, Debug)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/*
    Prevotes and precommits for every round of one height.

    Rounds up to the current round + 1 are created as we move through them.
    A peer may open at most two further rounds with its own votes, which
    bounds what a Byzantine peer can make us allocate.
*/
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: Height,
    validators: ValidatorSet,
    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, Vec<Round>>,
}

impl HeightVoteSet {
    pub fn new(chain_id: &str, height: Height, validators: ValidatorSet) -> Self {
        let mut hvs = HeightVoteSet {
            chain_id: chain_id.to_string(),
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        hvs.add_round(0);
        hvs.add_round(1);
        hvs
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    fn add_round(&mut self, round: Round) {
        if self.round_vote_sets.contains_key(&round) {
            return;
        }
        let make = |vote_type| VoteSet::new(&self.chain_id, self.height, round, vote_type, self.validators.clone());
        let rvs = RoundVoteSet {
            prevotes: make(VoteType::Prevote),
            precommits: make(VoteType::Precommit),
        };
        self.round_vote_sets.insert(round, rvs);
    }

    /// Opens vote sets for every round up to `round + 1`.
    pub fn set_round(&mut self, round: Round) {
        for r in self.round..=round.saturating_add(1) {
            self.add_round(r);
        }
        self.round = self.round.max(round);
    }

    /// Adds a vote. `peer` is None for this node's own votes.
    pub fn add_vote(&mut self, vote: Vote, peer: Option<&PeerId>) -> Result<bool, VoteError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            if let Some(peer) = peer {
                let rounds = self.peer_catchup_rounds.entry(peer.clone()).or_default();
                if rounds.len() >= MAX_CATCHUP_ROUNDS {
                    return Err(VoteError::TooManyCatchupRounds(peer.clone()));
                }
                rounds.push(vote.round);
            }
            self.add_round(vote.round);
        }
        let set = self
            .vote_set_mut(vote.round, vote.vote_type)
            .ok_or(VoteError::UnknownRound(vote.round))?;
        set.add_vote(vote)
    }

    fn vote_set_mut(&mut self, round: Round, vote_type: VoteType) -> Option<&mut VoteSet> {
        self.round_vote_sets.get_mut(&round).map(|rvs| match vote_type {
            VoteType::Prevote => &mut rvs.prevotes,
            VoteType::Precommit => &mut rvs.precommits,
        })
    }

    pub fn vote_set(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| match vote_type {
            VoteType::Prevote => &rvs.prevotes,
            VoteType::Precommit => &rvs.precommits,
        })
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Precommit)
    }

    /// Latest round at or below the current one with a non-nil prevote
    /// majority, and its block.
    pub fn pol_info(&self) -> Option<(Round, BlockId)> {
        (0..=self.round).rev().find_map(|r| {
            self.prevotes(r)
                .and_then(|set| set.two_thirds_majority())
                .filter(|id| !id.is_nil())
                .map(|id| (r, id))
        })
    }

    pub fn set_peer_maj23(
        &mut self,
        round: Round,
        vote_type: VoteType,
        peer: &PeerId,
        block_id: BlockId,
    ) -> Result<(), VoteError> {
        let set = self
            .vote_set_mut(round, vote_type)
            .ok_or(VoteError::UnknownRound(round))?;
        set.set_peer_maj23(peer, block_id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::vote_set::test_helpers::*;
    use super::*;

    const CHAIN: &str = "test-chain";

    #[test]
    fn test_peer_catchup_rounds_are_bounded() {
        let (set, keys) = validators(&[1, 1, 1, 1]);
        let mut hvs = HeightVoteSet::new(CHAIN, 1, set);
        let peer: PeerId = "peer".to_string();

        for round in [5, 6] {
            let vote = signed_vote(CHAIN, &keys[0], 0, 1, round, VoteType::Prevote, block_id(1));
            assert_eq!(hvs.add_vote(vote, Some(&peer)), Ok(true));
        }
        let vote = signed_vote(CHAIN, &keys[0], 0, 1, 7, VoteType::Prevote, block_id(1));
        assert_eq!(
            hvs.add_vote(vote.clone(), Some(&peer)),
            Err(VoteError::TooManyCatchupRounds(peer.clone()))
        );

        // own votes are never limited
        assert_eq!(hvs.add_vote(vote, None), Ok(true));
    }

    #[test]
    fn test_pol_info_finds_latest_polka() {
        let (set, keys) = validators(&[1, 1, 1]);
        let mut hvs = HeightVoteSet::new(CHAIN, 1, set);
        hvs.set_round(3);
        for round in [0, 2] {
            for (i, key) in keys.iter().enumerate() {
                let vote = signed_vote(CHAIN, key, i, 1, round, VoteType::Prevote, block_id(round as u8 + 1));
                hvs.add_vote(vote, None).unwrap();
            }
        }
        for (i, key) in keys.iter().enumerate() {
            let vote = signed_vote(CHAIN, key, i, 1, 3, VoteType::Prevote, BlockId::nil());
            hvs.add_vote(vote, None).unwrap();
        }
        assert_eq!(hvs.pol_info(), Some((2, block_id(3))));
    }
}
