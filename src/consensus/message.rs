use serde::{Deserialize, Serialize};

use super::round_state::Step;
use crate::common::bits::BitArray;
use crate::network::{ChannelId, PeerId};
use crate::types::{
    decode, encode, BlockId, CodecError, Height, Part, PartSetHeader, Proposal, Round, Vote, VoteType,
};

/*
    Messages exchanged between consensus instances. Each carries enough of
    (height, round, step, validator index) for the receiver to route it
    against its own round state without further lookups.

        State channel        NewRoundStep, NewValidBlock, HasVote, VoteSetMaj23
        Data channel         Proposal, ProposalPol, BlockPart
        Vote channel         Vote
        VoteSetBits channel  VoteSetBits
*/
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ConsensusMessage {
    NewRoundStep {
        height: Height,
        round: Round,
        step: Step,
        seconds_since_start_time: u64,
        last_commit_round: Round,
    },
    NewValidBlock {
        height: Height,
        round: Round,
        block_parts_header: PartSetHeader,
        block_parts: BitArray,
        is_commit: bool,
    },
    Proposal(Proposal),
    ProposalPol {
        height: Height,
        proposal_pol_round: Round,
        proposal_pol: BitArray,
    },
    BlockPart {
        height: Height,
        round: Round,
        part: Part,
    },
    Vote(Vote),
    HasVote {
        height: Height,
        round: Round,
        vote_type: VoteType,
        index: u32,
    },
    VoteSetMaj23 {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: BlockId,
    },
    VoteSetBits {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: BlockId,
        votes: BitArray,
    },
}

impl ConsensusMessage {
    pub fn channel(&self) -> ChannelId {
        match self {
            ConsensusMessage::NewRoundStep { .. }
            | ConsensusMessage::NewValidBlock { .. }
            | ConsensusMessage::HasVote { .. }
            | ConsensusMessage::VoteSetMaj23 { .. } => ChannelId::State,
            ConsensusMessage::Proposal(_)
            | ConsensusMessage::ProposalPol { .. }
            | ConsensusMessage::BlockPart { .. } => ChannelId::Data,
            ConsensusMessage::Vote(_) => ChannelId::Vote,
            ConsensusMessage::VoteSetBits { .. } => ChannelId::VoteSetBits,
        }
    }

    pub fn height(&self) -> Height {
        match self {
            ConsensusMessage::NewRoundStep { height, .. }
            | ConsensusMessage::NewValidBlock { height, .. }
            | ConsensusMessage::ProposalPol { height, .. }
            | ConsensusMessage::BlockPart { height, .. }
            | ConsensusMessage::HasVote { height, .. }
            | ConsensusMessage::VoteSetMaj23 { height, .. }
            | ConsensusMessage::VoteSetBits { height, .. } => *height,
            ConsensusMessage::Proposal(p) => p.height,
            ConsensusMessage::Vote(v) => v.height,
        }
    }

    /// Range checks that need no state.
    pub fn validate_basic(&self) -> Result<(), String> {
        let check = |height: Height, round: Round| {
            if height <= 0 {
                Err(format!("non-positive height {}", height))
            } else if round < 0 {
                Err(format!("negative round {}", round))
            } else {
                Ok(())
            }
        };
        match self {
            ConsensusMessage::NewRoundStep {
                height,
                round,
                last_commit_round,
                ..
            } => {
                check(*height, *round)?;
                if *last_commit_round < -1 {
                    return Err(format!("invalid last_commit_round {}", last_commit_round));
                }
                Ok(())
            }
            ConsensusMessage::NewValidBlock {
                height,
                round,
                block_parts_header,
                block_parts,
                ..
            } => {
                check(*height, *round)?;
                block_parts_header.validate_basic()?;
                if block_parts.size() != block_parts_header.total as usize {
                    return Err("block parts bit array does not match header".to_string());
                }
                Ok(())
            }
            ConsensusMessage::Proposal(p) => {
                check(p.height, p.round)?;
                if p.pol_round < -1 || p.pol_round >= p.round {
                    return Err(format!("invalid pol_round {} for round {}", p.pol_round, p.round));
                }
                if p.block_id.is_nil() {
                    return Err("proposal for nil".to_string());
                }
                p.block_id.validate_basic()
            }
            ConsensusMessage::ProposalPol {
                height,
                proposal_pol_round,
                ..
            } => check(*height, *proposal_pol_round),
            ConsensusMessage::BlockPart { height, round, .. } => check(*height, *round),
            ConsensusMessage::Vote(v) => {
                check(v.height, v.round)?;
                if v.signature.is_empty() {
                    return Err("unsigned vote".to_string());
                }
                v.block_id.validate_basic()
            }
            ConsensusMessage::HasVote { height, round, .. } => check(*height, *round),
            ConsensusMessage::VoteSetMaj23 {
                height,
                round,
                block_id,
                ..
            }
            | ConsensusMessage::VoteSetBits {
                height,
                round,
                block_id,
                ..
            } => {
                check(*height, *round)?;
                block_id.validate_basic()
            }
        }
    }
}

/// A message together with its origin. `peer_id` is None for messages this
/// node generated itself.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer_id: Option<PeerId>,
}

impl MsgInfo {
    pub fn internal(msg: ConsensusMessage) -> Self {
        MsgInfo { msg, peer_id: None }
    }

    pub fn from_peer(msg: ConsensusMessage, peer_id: PeerId) -> Self {
        MsgInfo {
            msg,
            peer_id: Some(peer_id),
        }
    }
}

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Largest accepted consensus message, one block part plus overhead.
pub const MAX_MSG_SIZE: usize = 1_048_576;

/// Wire codec: `[version: u8][bincode payload]`.
#[derive(Clone, Copy, Debug)]
pub struct MessageCodec {
    max_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec { max_size: MAX_MSG_SIZE }
    }
}

impl MessageCodec {
    pub fn new(max_size: usize) -> Self {
        MessageCodec { max_size }
    }

    pub fn encode(&self, msg: &ConsensusMessage) -> Result<Vec<u8>, CodecError> {
        let payload = encode(msg)?;
        if payload.len() + 1 > self.max_size {
            return Err(CodecError::TooLarge {
                size: payload.len() + 1,
                max: self.max_size,
            });
        }
        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(WIRE_VERSION);
        bytes.extend(payload);
        Ok(bytes)
    }

    pub fn decode(&self, data: &[u8]) -> Result<ConsensusMessage, CodecError> {
        if data.len() > self.max_size {
            return Err(CodecError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }
        let (version, payload) = data
            .split_first()
            .ok_or_else(|| CodecError::Decode("empty message".to_string()))?;
        if *version != WIRE_VERSION {
            return Err(CodecError::Decode(format!("unknown wire version {}", version)));
        }
        let msg: ConsensusMessage = decode(payload)?;
        msg.validate_basic().map_err(CodecError::Decode)?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::crypto::Keypair;
    use crate::consensus::vote_set::test_helpers::signed_vote;
    use crate::types::{Timestamp, MAX_BLOCK_PARTS};

    #[test]
    fn test_codec_rejects_bad_frames() {
        let codec = MessageCodec::default();
        let msg = ConsensusMessage::HasVote {
            height: 3,
            round: 1,
            vote_type: VoteType::Prevote,
            index: 2,
        };
        let mut bytes = codec.encode(&msg).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), msg);

        bytes[0] = 9;
        assert!(codec.decode(&bytes).is_err());
        assert!(codec.decode(&[]).is_err());
        assert!(codec.decode(&[WIRE_VERSION, 0xff]).is_err());
    }

    #[test]
    fn test_validate_basic_rejects_bad_pol_round() {
        let block_id = BlockId {
            hash: [1u8; 32],
            parts: PartSetHeader { total: 1, hash: [1u8; 32] },
        };
        let proposal = Proposal::new(1, 2, 2, block_id, Timestamp(0));
        assert!(ConsensusMessage::Proposal(proposal).validate_basic().is_err());
        let proposal = Proposal::new(1, 2, 1, block_id, Timestamp(0));
        assert!(ConsensusMessage::Proposal(proposal).validate_basic().is_ok());
    }

    #[test]
    fn test_validate_basic_bounds_heights_and_part_counts() {
        let has_vote = |height| ConsensusMessage::HasVote {
            height,
            round: 0,
            vote_type: VoteType::Prevote,
            index: 0,
        };
        assert!(has_vote(0).validate_basic().is_err());
        assert!(has_vote(-4).validate_basic().is_err());
        assert!(has_vote(1).validate_basic().is_ok());

        for total in [0, MAX_BLOCK_PARTS + 1, 20_000_000] {
            let block_id = BlockId {
                hash: [1u8; 32],
                parts: PartSetHeader { total, hash: [1u8; 32] },
            };
            let proposal = Proposal::new(1, 0, -1, block_id, Timestamp(0));
            assert!(ConsensusMessage::Proposal(proposal).validate_basic().is_err());

            let key = Keypair::from_seed(&[1; 32]);
            let vote = signed_vote("test-chain", &key, 0, 1, 0, VoteType::Prevote, block_id);
            assert!(ConsensusMessage::Vote(vote).validate_basic().is_err());
        }

        let proposal = Proposal::new(1, 0, -1, BlockId::nil(), Timestamp(0));
        assert!(ConsensusMessage::Proposal(proposal).validate_basic().is_err());
    }

    #[test]
    fn test_channel_routing() {
        let msg = ConsensusMessage::VoteSetBits {
            height: 1,
            round: 0,
            vote_type: VoteType::Precommit,
            block_id: BlockId::nil(),
            votes: BitArray::new(4),
        };
        assert_eq!(msg.channel(), ChannelId::VoteSetBits);
        assert_eq!(msg.channel().as_byte(), 0x23);
    }
}
