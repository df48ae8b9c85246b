use std::collections::VecDeque;
use std::mem;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use super::message::{ConsensusMessage, MsgInfo};
use super::round_state::{RoundState, Step};
use super::timeout::TimeoutInfo;
use super::vote_set::{VoteError, VoteSet};
use super::wal::{TimedWalMessage, Wal, WalError, WalMessage};
use crate::common::bits::BitArray;
use crate::common::crypto::{Address, Signature};
use crate::config::ConsensusConfig;
use crate::network::PeerId;
use crate::signer::Signer;
use crate::state::{validate_block, BlockExecutor, ExecError, State};
use crate::storage::{BlockStore, StoreError};
use crate::types::{
    Block, BlockId, CodecError, Commit, Evidence, Hashable, Height, Part, PartSet, Proposal, Round,
    Timestamp, Vote, VoteType, BLOCK_PART_SIZE, MAX_BLOCK_SIZE_BYTES,
};

/// Evidence included in one proposed block.
const MAX_EVIDENCE_PER_BLOCK: usize = 50;

/// Errors that stop the state machine. Invalid input from peers never
/// surfaces here; it is logged and dropped.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Wal(#[from] WalError),

    #[error("block execution failed: {0}")]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("cannot reconstruct last commit: {0}")]
    LastCommit(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("wal replay failed: {0}")]
    Replay(String),
}

/// Input to the state machine.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ConsensusEvent {
    Message(MsgInfo),
    Timeout(TimeoutInfo),
    TxsAvailable,
}

/// Side effects for the driver to carry out after each event.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Output {
    Broadcast(ConsensusMessage),
    SendTo(PeerId, ConsensusMessage),
    ScheduleTimeout(TimeoutInfo),
}

/*
    The round-based state machine for one node.

    Every event is appended to the WAL before it is applied. Messages the
    node produces itself (its proposal, block parts, votes) are queued and
    applied after the current event, each written to the WAL synchronously
    first. Network sends and timers are returned as outputs so the machine
    stays free of I/O beyond the WAL and the stores.

    In replay mode nothing is signed, broadcast or written; timeouts are
    remembered and re-armed once replay finishes.
*/
pub struct ConsensusState {
    pub(super) config: ConsensusConfig,
    pub(super) state: State,
    pub(super) rs: RoundState,
    pub(super) executor: BlockExecutor,
    pub(super) block_store: BlockStore,
    pub(super) signer: Option<Box<dyn Signer>>,
    pub(super) address: Option<Address>,
    pub(super) wal: Box<dyn Wal>,

    internal_queue: VecDeque<MsgInfo>,
    outputs: Vec<Output>,
    pub(super) pending_timeout: Option<TimeoutInfo>,
    pub(super) deferred_timeout: Option<TimeoutInfo>,
    pub(super) replay_mode: bool,
    pub(super) now: Timestamp,
}

impl ConsensusState {
    pub fn new(
        config: ConsensusConfig,
        state: State,
        executor: BlockExecutor,
        block_store: BlockStore,
        wal: Box<dyn Wal>,
    ) -> Result<Self, ConsensusError> {
        let rs = RoundState::new(&state.chain_id, state.next_height(), state.validators.clone());
        let mut cs = ConsensusState {
            config,
            state: state.clone(),
            rs,
            executor,
            block_store,
            signer: None,
            address: None,
            wal,
            internal_queue: VecDeque::new(),
            outputs: Vec::new(),
            pending_timeout: None,
            deferred_timeout: None,
            replay_mode: false,
            now: Timestamp::default(),
        };
        cs.update_to_state(state)?;
        Ok(cs)
    }

    pub fn set_signer(&mut self, signer: Box<dyn Signer>) {
        self.address = Some(signer.public_key().address());
        self.signer = Some(signer);
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn chain_state(&self) -> &State {
        &self.state
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    pub fn executor(&self) -> &BlockExecutor {
        &self.executor
    }

    /// The most recently scheduled timeout.
    pub fn pending_timeout(&self) -> Option<TimeoutInfo> {
        self.pending_timeout
    }

    pub fn take_outputs(&mut self) -> Vec<Output> {
        mem::take(&mut self.outputs)
    }

    pub fn flush_wal(&mut self) -> Result<(), ConsensusError> {
        self.wal.flush_and_sync()?;
        Ok(())
    }

    /// Replays the WAL for the current height, then schedules the first
    /// round if the height has not started yet.
    pub fn start(&mut self, now: Timestamp) -> Result<(), ConsensusError> {
        self.now = now;
        if self.rs.commit_time == Timestamp::default() {
            self.rs.start_time = self.config.commit(now);
        }

        let height = self.rs.height;
        match self.catchup_replay(height) {
            Ok(()) => {}
            Err(ConsensusError::Replay(reason)) => {
                error!(height, %reason, "catch-up replay failed, starting anyway")
            }
            Err(ConsensusError::Wal(e)) if e.is_data_corruption() => {
                error!(height, err = %e, "wal corrupted, starting without replay")
            }
            Err(e) => {
                self.replay_mode = false;
                return Err(e);
            }
        }

        self.now = now;
        self.finish_replay();
        if self.rs.step == Step::NewHeight {
            self.schedule_round0();
        }
        self.process_internal()
    }

    /// Applies one event: WAL first, then the transition, then any messages
    /// the transition produced.
    pub fn handle_event(&mut self, event: ConsensusEvent, now: Timestamp) -> Result<(), ConsensusError> {
        self.now = now;
        match event {
            ConsensusEvent::Message(mi) => {
                self.write_wal(WalMessage::MsgInfo(mi.clone()))?;
                self.handle_msg(mi)?;
            }
            ConsensusEvent::Timeout(ti) => {
                self.write_wal(WalMessage::Timeout(ti))?;
                self.handle_timeout(ti)?;
            }
            ConsensusEvent::TxsAvailable => {
                self.write_wal(WalMessage::TxsAvailable)?;
                self.handle_txs_available()?;
            }
        }
        self.process_internal()
    }

    fn write_wal(&mut self, msg: WalMessage) -> Result<(), ConsensusError> {
        if self.replay_mode {
            return Ok(());
        }
        self.wal.write(TimedWalMessage { time: self.now, msg })?;
        Ok(())
    }

    pub(super) fn process_internal(&mut self) -> Result<(), ConsensusError> {
        while let Some(mi) = self.internal_queue.pop_front() {
            if !self.replay_mode {
                self.wal.write_sync(TimedWalMessage {
                    time: self.now,
                    msg: WalMessage::MsgInfo(mi.clone()),
                })?;
                self.outputs.push(Output::Broadcast(mi.msg.clone()));
            }
            self.handle_msg(mi)?;
        }
        Ok(())
    }

    fn send_internal(&mut self, msg: ConsensusMessage) {
        self.internal_queue.push_back(MsgInfo::internal(msg));
    }

    fn broadcast(&mut self, msg: ConsensusMessage) {
        if !self.replay_mode {
            self.outputs.push(Output::Broadcast(msg));
        }
    }

    pub(super) fn handle_msg(&mut self, mi: MsgInfo) -> Result<(), ConsensusError> {
        let MsgInfo { msg, peer_id } = mi;
        if let Some(peer) = &peer_id {
            if let Err(reason) = msg.validate_basic() {
                warn!(%peer, %reason, "dropping invalid peer message");
                return Ok(());
            }
        }
        match msg {
            ConsensusMessage::Proposal(proposal) => self.set_proposal(proposal),
            ConsensusMessage::BlockPart { height, part, .. } => {
                self.add_proposal_block_part(height, part, peer_id.as_ref())?
            }
            ConsensusMessage::Vote(vote) => {
                self.add_vote(vote, peer_id.as_ref())?;
            }
            ConsensusMessage::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => self.handle_vote_set_maj23(height, round, vote_type, block_id, peer_id),
            other => trace!(msg = ?other, "ignoring peer state message"),
        }
        Ok(())
    }

    pub(super) fn handle_timeout(&mut self, ti: TimeoutInfo) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if ti.height != rs.height || ti.round < rs.round || (ti.round == rs.round && ti.step < rs.step) {
            debug!(timeout = %ti, current = %rs.summary(), "ignoring stale timeout");
            return Ok(());
        }
        debug!(timeout = %ti, "received timeout");
        match ti.step {
            Step::NewHeight => self.enter_new_round(ti.height, 0),
            Step::NewRound => self.enter_propose(ti.height, 0),
            Step::Propose => self.enter_prevote(ti.height, ti.round),
            Step::PrevoteWait => self.enter_precommit(ti.height, ti.round),
            Step::PrecommitWait => {
                self.enter_precommit(ti.height, ti.round)?;
                self.enter_new_round(ti.height, ti.round + 1)
            }
            step => {
                warn!(%step, "unexpected timeout step");
                Ok(())
            }
        }
    }

    pub(super) fn handle_txs_available(&mut self) -> Result<(), ConsensusError> {
        if self.rs.round != 0 || self.rs.step != Step::NewRound {
            trace!(current = %self.rs.summary(), "ignoring txs available");
            return Ok(());
        }
        self.enter_propose(self.rs.height, 0)
    }

    fn handle_vote_set_maj23(
        &mut self,
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: BlockId,
        peer: Option<PeerId>,
    ) {
        let Some(peer) = peer else { return };
        if height != self.rs.height {
            return;
        }
        if let Err(e) = self.rs.votes.set_peer_maj23(round, vote_type, &peer, block_id) {
            debug!(%peer, err = %e, "rejected peer majority claim");
            return;
        }
        if self.replay_mode {
            return;
        }
        let votes = self
            .rs
            .votes
            .vote_set(round, vote_type)
            .and_then(|set| set.bit_array_by_block_id(&block_id))
            .unwrap_or_else(|| BitArray::new(self.rs.validators.size()));
        let reply = ConsensusMessage::VoteSetBits {
            height,
            round,
            vote_type,
            block_id,
            votes,
        };
        self.outputs.push(Output::SendTo(peer, reply));
    }

    // ---- transitions ----

    /// Resets the round state for the height after `state`.
    fn update_to_state(&mut self, state: State) -> Result<(), ConsensusError> {
        let last_commit = if self.rs.commit_round > -1 && self.rs.height == state.last_block_height {
            self.rs.votes.precommits(self.rs.commit_round).cloned()
        } else {
            self.reconstruct_last_commit(&state)?
        };

        let commit_time = self.rs.commit_time;
        let start_time = if commit_time == Timestamp::default() {
            self.config.commit(self.now)
        } else {
            self.config.commit(commit_time)
        };

        let mut rs = RoundState::new(&state.chain_id, state.next_height(), state.validators.clone());
        rs.start_time = start_time;
        rs.commit_time = commit_time;
        rs.last_commit = last_commit;
        rs.last_validators = state.last_validators.clone();
        self.rs = rs;
        self.state = state;
        Ok(())
    }

    fn reconstruct_last_commit(&self, state: &State) -> Result<Option<VoteSet>, ConsensusError> {
        if state.last_block_height < state.initial_height {
            return Ok(None);
        }
        let height = state.last_block_height;
        let seen = self
            .block_store
            .load_seen_commit(height)?
            .ok_or_else(|| ConsensusError::LastCommit(format!("no seen commit for height {}", height)))?;
        let mut votes = VoteSet::new(
            &state.chain_id,
            height,
            seen.round(),
            VoteType::Precommit,
            state.last_validators.clone(),
        );
        for vote in seen.precommits.into_iter().flatten() {
            votes
                .add_vote(vote)
                .map_err(|e| ConsensusError::LastCommit(e.to_string()))?;
        }
        if !votes.has_two_thirds_majority() {
            return Err(ConsensusError::LastCommit(format!(
                "seen commit for height {} lacks a two-thirds majority",
                height
            )));
        }
        Ok(Some(votes))
    }

    fn schedule_round0(&mut self) {
        let sleep = self.rs.start_time.duration_since(self.now);
        self.schedule_timeout(sleep, self.rs.height, 0, Step::NewHeight);
    }

    fn schedule_timeout(&mut self, duration: Duration, height: Height, round: Round, step: Step) {
        let ti = TimeoutInfo::new(duration, height, round, step);
        self.pending_timeout = Some(ti);
        if self.replay_mode {
            self.deferred_timeout = Some(ti);
        } else {
            self.outputs.push(Output::ScheduleTimeout(ti));
        }
    }

    fn update_step(&mut self, round: Round, step: Step) {
        self.rs.round = round;
        self.rs.step = step;
        self.new_step();
    }

    fn new_step(&mut self) {
        debug!(step = %self.rs.summary(), "new step");
        let last_commit_round = self.rs.last_commit.as_ref().map(|c| c.round()).unwrap_or(-1);
        self.broadcast(ConsensusMessage::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
            seconds_since_start_time: self.now.duration_since(self.rs.start_time).as_secs(),
            last_commit_round,
        });
    }

    fn enter_new_round(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step != Step::NewHeight) {
            trace!(height, round, current = %rs.summary(), "skipping new round");
            return Ok(());
        }
        if self.now < rs.start_time {
            debug!(height, round, "entering new round before start time");
        }
        info!(height, round, "entering new round");

        if self.rs.round < round {
            let skipped = (round - self.rs.round) as u32;
            self.rs.validators.increment_proposer_priority(skipped);
        }
        if round != 0 {
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.votes.set_round(round);
        self.rs.triggered_timeout_precommit = false;
        self.update_step(round, Step::NewRound);

        let wait_for_txs = self.config.wait_for_txs() && round == 0 && !self.need_proof_block(height);
        if !wait_for_txs {
            return self.enter_propose(height, round);
        }
        if self.config.create_empty_blocks_interval_ms > 0 {
            self.schedule_timeout(self.config.empty_blocks_interval(), height, round, Step::NewRound);
        }
        if self.executor.tx_source().size() > 0 {
            self.enter_propose(height, round)?;
        }
        Ok(())
    }

    /// The first block of the chain and any block after an app hash change
    /// must be produced even without transactions.
    fn need_proof_block(&self, height: Height) -> bool {
        if height == self.state.initial_height {
            return true;
        }
        match self.block_store.load_block_meta(height - 1) {
            Ok(Some(meta)) => meta.header.app_hash != self.state.app_hash,
            Ok(None) => true,
            Err(e) => {
                warn!(height, err = %e, "cannot load previous block meta");
                true
            }
        }
    }

    fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && Step::Propose <= rs.step) {
            trace!(height, round, current = %rs.summary(), "skipping propose");
            return Ok(());
        }
        debug!(height, round, "entering propose");

        self.schedule_timeout(self.config.propose(round), height, round, Step::Propose);
        self.update_step(round, Step::Propose);

        if self.is_proposer() {
            if self.replay_mode {
                debug!(height, round, "proposer in replay, not proposing");
            } else {
                info!(height, round, "our turn to propose");
                self.decide_proposal(height, round)?;
            }
        }

        if self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn is_proposer(&self) -> bool {
        match (self.address, self.rs.validators.proposer()) {
            (Some(address), Some(proposer)) => proposer.address == address,
            _ => false,
        }
    }

    fn decide_proposal(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        let (block, parts, pol_round) = match (&rs.valid_block, &rs.valid_block_parts, &rs.locked_block, &rs.locked_block_parts) {
            (Some(block), Some(parts), _, _) => (block.clone(), parts.clone(), rs.valid_round),
            (_, _, Some(block), Some(parts)) => (block.clone(), parts.clone(), rs.locked_round),
            _ => match self.create_proposal_block()? {
                Some((block, parts)) => (block, parts, -1),
                None => return Ok(()),
            },
        };

        let block_id = BlockId {
            hash: block.hash(),
            parts: parts.header(),
        };
        let mut proposal = Proposal::new(height, round, pol_round, block_id, self.now);
        let Some(signer) = self.signer.as_mut() else {
            return Ok(());
        };
        if let Err(e) = signer.sign_proposal(&self.state.chain_id, &mut proposal) {
            error!(height, round, err = %e, "failed signing proposal");
            return Ok(());
        }
        info!(
            height,
            round,
            block = %block_id.short(),
            pol_round,
            txs = block.txs.len(),
            "signed proposal"
        );

        self.send_internal(ConsensusMessage::Proposal(proposal));
        for index in 0..parts.total() {
            if let Some(part) = parts.get_part(index) {
                self.send_internal(ConsensusMessage::BlockPart {
                    height,
                    round,
                    part: part.clone(),
                });
            }
        }
        Ok(())
    }

    fn create_proposal_block(&self) -> Result<Option<(Block, PartSet)>, ConsensusError> {
        let height = self.rs.height;
        let last_commit = if height == self.state.initial_height {
            Commit::default()
        } else {
            match self.rs.last_commit.as_ref().and_then(|votes| votes.make_commit()) {
                Some(commit) => commit,
                None => {
                    warn!(height, "no commit for the previous block, cannot propose");
                    return Ok(None);
                }
            }
        };
        let Some(address) = self.address else {
            return Ok(None);
        };

        let limits = self.state.consensus_params.block_size;
        let mut txs = self.executor.tx_source().reap(limits.max_bytes, limits.max_gas);
        if limits.max_txs >= 0 {
            txs.truncate(limits.max_txs as usize);
        }
        let evidence = self.executor.evidence_pool().pending_evidence(MAX_EVIDENCE_PER_BLOCK);

        let block = self
            .state
            .make_block(height, txs, last_commit, evidence, address, self.valid_time());
        let parts = block.make_part_set(BLOCK_PART_SIZE)?;
        Ok(Some((block, parts)))
    }

    fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };
        if self.rs.proposal_block.is_none() {
            return false;
        }
        proposal.pol_round < 0
            || self
                .rs
                .votes
                .prevotes(proposal.pol_round)
                .map_or(false, |set| set.has_two_thirds_majority())
    }

    fn prevote_majority(&self, round: Round) -> Option<BlockId> {
        self.rs.votes.prevotes(round).and_then(|set| set.two_thirds_majority())
    }

    fn precommit_majority(&self, round: Round) -> Option<BlockId> {
        self.rs.votes.precommits(round).and_then(|set| set.two_thirds_majority())
    }

    fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && Step::Prevote <= rs.step) {
            trace!(height, round, current = %rs.summary(), "skipping prevote");
            return Ok(());
        }
        debug!(height, round, "entering prevote");
        self.update_step(round, Step::Prevote);
        let target = self.prevote_target(round);
        self.sign_add_vote(VoteType::Prevote, target);
        Ok(())
    }

    /*
        Prevote the proposed block when it is complete and valid, and either
        we hold no lock, the lock is on this very block, or the proposal
        carries a POL round later than our lock that we saw a polka for.
        Everything else is a nil prevote.
    */
    pub(super) fn prevote_target(&self, round: Round) -> BlockId {
        let (Some(proposal), Some(block)) = (&self.rs.proposal, &self.rs.proposal_block) else {
            debug!(round, "no proposal block, prevoting nil");
            return BlockId::nil();
        };
        let block_id = proposal.block_id;
        if !block.hashes_to(&block_id.hash) {
            warn!(round, block = %block_id.short(), "proposal block does not match proposal");
            return BlockId::nil();
        }

        if let Some(locked) = self.rs.locked_block_id() {
            if locked == block_id {
                debug!(round, block = %block_id.short(), "prevoting locked block");
                return block_id;
            }
            let unlocked_by_pol = proposal.pol_round > self.rs.locked_round
                && proposal.pol_round < round
                && self.prevote_majority(proposal.pol_round) == Some(block_id);
            if !unlocked_by_pol {
                debug!(
                    round,
                    locked = %locked.short(),
                    proposed = %block_id.short(),
                    "locked on another block, prevoting nil"
                );
                return BlockId::nil();
            }
        }

        match validate_block(&self.state, block) {
            Ok(()) => block_id,
            Err(e) => {
                warn!(round, err = %e, "proposal block invalid, prevoting nil");
                BlockId::nil()
            }
        }
    }

    fn enter_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && Step::PrevoteWait <= rs.step) {
            return Ok(());
        }
        let any = rs.votes.prevotes(round).map_or(false, |set| set.has_two_thirds_any());
        if !any {
            warn!(height, round, "prevote wait without two-thirds of prevotes");
            return Ok(());
        }
        debug!(height, round, "entering prevote wait");
        self.update_step(round, Step::PrevoteWait);
        self.schedule_timeout(self.config.prevote(round), height, round, Step::PrevoteWait);
        Ok(())
    }

    fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && Step::Precommit <= rs.step) {
            trace!(height, round, current = %rs.summary(), "skipping precommit");
            return Ok(());
        }
        debug!(height, round, "entering precommit");
        self.update_step(round, Step::Precommit);
        let target = self.precommit_target(round);
        self.sign_add_vote(VoteType::Precommit, target);
        Ok(())
    }

    /*
        Precommit the block with a polka in this round, locking on it.
        A polka for nil or no polka at all precommits nil and leaves any
        existing lock alone.
    */
    pub(super) fn precommit_target(&mut self, round: Round) -> BlockId {
        let Some(maj) = self.prevote_majority(round) else {
            debug!(round, "no polka, precommitting nil");
            return BlockId::nil();
        };
        if maj.is_nil() {
            debug!(round, "polka for nil, precommitting nil");
            return BlockId::nil();
        }

        if self.rs.locked_block_id() == Some(maj) {
            debug!(round, block = %maj.short(), "relocking block");
            self.rs.locked_round = round;
            return maj;
        }

        let proposed = self
            .rs
            .proposal_block
            .as_ref()
            .filter(|block| block.hashes_to(&maj.hash))
            .cloned();
        if let Some(block) = proposed {
            if let Err(e) = validate_block(&self.state, &block) {
                error!(round, block = %maj.short(), err = %e, "polka for an invalid block, precommitting nil");
                return BlockId::nil();
            }
            info!(height = self.rs.height, round, block = %maj.short(), "locking block");
            self.rs.locked_round = round;
            self.rs.locked_block = Some(block);
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            return maj;
        }

        debug!(round, block = %maj.short(), "polka for a block we do not have, precommitting nil");
        self.rs.proposal_block = None;
        if !self.has_parts_header(&maj) {
            self.rs.proposal_block_parts = Some(PartSet::from_header(maj.parts));
        }
        BlockId::nil()
    }

    fn has_parts_header(&self, block_id: &BlockId) -> bool {
        self.rs
            .proposal_block_parts
            .as_ref()
            .map_or(false, |parts| parts.has_header(&block_id.parts))
    }

    fn enter_precommit_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.triggered_timeout_precommit) {
            return Ok(());
        }
        let any = rs.votes.precommits(round).map_or(false, |set| set.has_two_thirds_any());
        if !any {
            warn!(height, round, "precommit wait without two-thirds of precommits");
            return Ok(());
        }
        debug!(height, round, "entering precommit wait");
        self.rs.triggered_timeout_precommit = true;
        if self.rs.step == Step::Precommit {
            self.update_step(round, Step::PrecommitWait);
        }
        self.schedule_timeout(self.config.precommit(round), height, round, Step::PrecommitWait);
        Ok(())
    }

    fn enter_commit(&mut self, height: Height, commit_round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height || Step::Commit <= self.rs.step {
            return Ok(());
        }
        let Some(maj) = self.precommit_majority(commit_round).filter(|id| !id.is_nil()) else {
            warn!(height, commit_round, "commit without a precommit majority");
            return Ok(());
        };
        info!(height, commit_round, block = %maj.short(), "entering commit");

        self.rs.step = Step::Commit;
        self.rs.commit_round = commit_round;
        self.rs.commit_time = self.now;
        self.new_step();

        if self.rs.locked_block_id() == Some(maj) {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .map_or(false, |block| block.hashes_to(&maj.hash));
        if !have_block && !self.has_parts_header(&maj) {
            self.rs.proposal_block = None;
            let parts = PartSet::from_header(maj.parts);
            let block_parts = parts.bit_array().clone();
            self.rs.proposal_block_parts = Some(parts);
            self.broadcast(ConsensusMessage::NewValidBlock {
                height,
                round: commit_round,
                block_parts_header: maj.parts,
                block_parts,
                is_commit: true,
            });
        }

        self.try_finalize_commit(height)
    }

    fn try_finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height {
            return Ok(());
        }
        let Some(maj) = self.precommit_majority(self.rs.commit_round).filter(|id| !id.is_nil()) else {
            return Ok(());
        };
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .map_or(false, |block| block.hashes_to(&maj.hash));
        if !have_block {
            debug!(height, block = %maj.short(), "waiting for the committed block");
            return Ok(());
        }
        self.finalize_commit(height)
    }

    fn finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step != Step::Commit {
            return Ok(());
        }
        let commit_round = self.rs.commit_round;
        let block_id = self
            .precommit_majority(commit_round)
            .ok_or_else(|| ConsensusError::Commit(format!("no precommit majority at {}/{}", height, commit_round)))?;
        let (Some(block), Some(parts)) = (self.rs.proposal_block.clone(), self.rs.proposal_block_parts.clone()) else {
            return Ok(());
        };
        if parts.header() != block_id.parts {
            return Err(ConsensusError::Commit(format!(
                "block parts do not match the committed block at height {}",
                height
            )));
        }
        self.executor.validate_block(&self.state, &block)?;

        info!(
            height,
            block = %block_id.short(),
            txs = block.txs.len(),
            "finalizing commit"
        );

        if self.block_store.height()? < block.height() {
            let seen_commit = self
                .rs
                .votes
                .precommits(commit_round)
                .and_then(|set| set.make_commit())
                .ok_or_else(|| ConsensusError::Commit(format!("cannot build commit for height {}", height)))?;
            self.block_store.save_block(&block, &block_id, &seen_commit)?;
        } else {
            debug!(height, "block already stored");
        }

        // Marks everything before it as belonging to a committed height.
        self.wal.write_sync(TimedWalMessage {
            time: self.now,
            msg: WalMessage::EndHeight(height),
        })?;

        let state = self.state.clone();
        let next = self.executor.apply_block(&state, &block_id, &block)?;
        self.update_to_state(next)?;
        self.schedule_round0();
        Ok(())
    }

    // ---- proposals and votes ----

    fn set_proposal(&mut self, proposal: Proposal) {
        if let Some(existing) = self.rs.proposal.clone() {
            if existing != proposal && existing.height == proposal.height && existing.round == proposal.round {
                self.check_conflicting_proposal(existing, proposal);
            }
            return;
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            trace!(height = proposal.height, round = proposal.round, "proposal for another round");
            return;
        }
        if proposal.pol_round < -1 || (proposal.pol_round >= 0 && proposal.pol_round >= proposal.round) {
            warn!(pol_round = proposal.pol_round, round = proposal.round, "invalid proposal pol round");
            return;
        }
        let total = proposal.block_id.parts.total;
        if total == 0 || total > self.max_block_parts() {
            warn!(total, max = self.max_block_parts(), "proposal announces an impossible part count");
            return;
        }
        let Some(proposer) = self.rs.validators.proposer() else {
            return;
        };
        if !proposal.verify(&self.state.chain_id, &proposer.pub_key) {
            warn!(height = proposal.height, round = proposal.round, "invalid proposal signature");
            return;
        }

        info!(
            height = proposal.height,
            round = proposal.round,
            block = %proposal.block_id.short(),
            pol_round = proposal.pol_round,
            "received proposal"
        );
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts = Some(PartSet::from_header(proposal.block_id.parts));
        }
        self.rs.proposal = Some(proposal);
    }

    /// Parts a block within the current size limit can be split into.
    fn max_block_parts(&self) -> u32 {
        let max_bytes = self.state.consensus_params.block_size.max_bytes.max(0) as usize;
        let parts = max_bytes.min(MAX_BLOCK_SIZE_BYTES) / BLOCK_PART_SIZE + 1;
        parts as u32
    }

    fn check_conflicting_proposal(&mut self, existing: Proposal, proposal: Proposal) {
        let Some(proposer) = self.rs.validators.proposer() else {
            return;
        };
        if !proposal.verify(&self.state.chain_id, &proposer.pub_key) {
            return;
        }
        let evidence = Evidence::ConflictingProposal {
            pub_key: proposer.pub_key.clone(),
            proposal_a: Box::new(existing),
            proposal_b: Box::new(proposal),
        };
        self.report_evidence(evidence);
    }

    fn add_proposal_block_part(
        &mut self,
        height: Height,
        part: Part,
        peer: Option<&PeerId>,
    ) -> Result<(), ConsensusError> {
        if height != self.rs.height {
            trace!(height, "block part for another height");
            return Ok(());
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            debug!(height, "block part before its header");
            return Ok(());
        };
        match parts.add_part(part) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                warn!(height, peer = ?peer, err = %e, "invalid block part");
                return Ok(());
            }
        }
        if !parts.is_complete() {
            return Ok(());
        }
        let block = match Block::from_parts(parts) {
            Ok(block) => block,
            Err(e) => {
                warn!(height, err = %e, "complete block parts do not decode");
                return Ok(());
            }
        };
        info!(height, hash = %hex::encode(&block.hash()[..6]), "received complete proposal block");
        self.rs.proposal_block = Some(block);

        let round = self.rs.round;
        let polka = self.prevote_majority(round).filter(|id| !id.is_nil());
        if let Some(block_id) = polka {
            if self.rs.valid_round < round {
                self.update_valid_block(round, block_id);
            }
        }

        if self.rs.step <= Step::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, round)?;
            if polka.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == Step::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(())
    }

    fn update_valid_block(&mut self, round: Round, block_id: BlockId) {
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .map_or(false, |block| block.hashes_to(&block_id.hash));
        if have_block {
            debug!(round, block = %block_id.short(), "updating valid block");
            self.rs.valid_round = round;
            self.rs.valid_block = self.rs.proposal_block.clone();
            self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
        } else {
            self.rs.proposal_block = None;
            if !self.has_parts_header(&block_id) {
                self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
            }
        }
        let block_parts = self
            .rs
            .proposal_block_parts
            .as_ref()
            .map(|parts| parts.bit_array().clone())
            .unwrap_or_else(|| BitArray::new(block_id.parts.total as usize));
        self.broadcast(ConsensusMessage::NewValidBlock {
            height: self.rs.height,
            round,
            block_parts_header: block_id.parts,
            block_parts,
            is_commit: false,
        });
    }

    fn report_evidence(&mut self, evidence: Evidence) {
        if Some(evidence.address()) == self.address {
            error!(height = evidence.height(), "found conflicting statements signed by our own key");
        }
        let height = evidence.height();
        let address = evidence.address();
        if self.executor.evidence_pool().add_evidence(evidence) {
            warn!(height, %address, "recorded evidence of misbehavior");
        }
    }

    fn add_vote(&mut self, vote: Vote, peer: Option<&PeerId>) -> Result<bool, ConsensusError> {
        let height = self.rs.height;
        if vote.height > height {
            trace!(height = vote.height, current = height, "vote from a future height");
            return Ok(false);
        }

        // a late precommit for the block we just committed
        if vote.height.checked_add(1) == Some(height) && vote.vote_type == VoteType::Precommit {
            if self.rs.step != Step::NewHeight {
                trace!(height = vote.height, "late precommit outside new height");
                return Ok(false);
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Ok(false);
            };
            let added = match last_commit.add_vote(vote) {
                Ok(added) => added,
                Err(e) => {
                    self.absorb_vote_error(e);
                    return Ok(false);
                }
            };
            let all = last_commit.has_all();
            if added && all && self.config.skip_timeout_commit {
                self.enter_new_round(height, 0)?;
            }
            return Ok(added);
        }

        if vote.height != height {
            trace!(height = vote.height, current = height, "vote for another height");
            return Ok(false);
        }

        let (round, vote_type, index) = (vote.round, vote.vote_type, vote.validator_index);
        let added = match self.rs.votes.add_vote(vote, peer) {
            Ok(added) => added,
            Err(VoteError::Conflicting { evidence, added }) => {
                self.report_evidence(*evidence);
                added
            }
            Err(e) => {
                self.absorb_vote_error(e);
                return Ok(false);
            }
        };
        if !added {
            return Ok(false);
        }
        self.broadcast(ConsensusMessage::HasVote {
            height,
            round,
            vote_type,
            index,
        });

        match vote_type {
            VoteType::Prevote => self.on_prevote_added(height, round)?,
            VoteType::Precommit => self.on_precommit_added(height, round)?,
        }
        Ok(true)
    }

    fn absorb_vote_error(&mut self, err: VoteError) {
        match err {
            VoteError::Conflicting { evidence, .. } => self.report_evidence(*evidence),
            other => debug!(err = %other, "dropping vote"),
        }
    }

    fn on_prevote_added(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let maj = self.prevote_majority(round);
        let any = self
            .rs
            .votes
            .prevotes(round)
            .map_or(false, |set| set.has_two_thirds_any());

        if let Some(block_id) = maj.filter(|id| !id.is_nil()) {
            if self.rs.valid_round < round && round == self.rs.round {
                self.update_valid_block(round, block_id);
            }
        }

        if self.rs.round < round && any {
            // the network is ahead of us
            return self.enter_new_round(height, round);
        }
        if self.rs.round == round && Step::Prevote <= self.rs.step {
            match maj {
                Some(id) if id.is_nil() || self.is_proposal_complete() => self.enter_precommit(height, round)?,
                _ if any => self.enter_prevote_wait(height, round)?,
                _ => {}
            }
            return Ok(());
        }
        let pol_round = self.rs.proposal.as_ref().map(|p| p.pol_round);
        if pol_round == Some(round) && round >= 0 && self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn on_precommit_added(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let Some(precommits) = self.rs.votes.precommits(round) else {
            return Ok(());
        };
        let maj = precommits.two_thirds_majority();
        let any = precommits.has_two_thirds_any();
        let all = precommits.has_all();

        match maj {
            Some(block_id) if block_id.is_nil() => {
                self.enter_new_round(height, round)?;
                self.enter_new_round(height, round.saturating_add(1))?;
            }
            Some(_) => {
                self.enter_new_round(height, round)?;
                self.enter_commit(height, round)?;
                if self.config.skip_timeout_commit && all {
                    self.enter_new_round(self.rs.height, 0)?;
                }
            }
            None if self.rs.round <= round && any => {
                self.enter_new_round(height, round)?;
                self.enter_precommit_wait(height, round)?;
            }
            None => {}
        }
        Ok(())
    }

    /// Now, or just after the last block if the local clock lags behind it.
    fn valid_time(&self) -> Timestamp {
        self.now.max(Timestamp(self.state.last_block_time.0 + 1))
    }

    pub(super) fn sign_add_vote(&mut self, vote_type: VoteType, block_id: BlockId) {
        if self.replay_mode {
            return;
        }
        let Some(address) = self.address else {
            return;
        };
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            return;
        };
        let mut vote = Vote {
            validator_address: address,
            validator_index: index as u32,
            height: self.rs.height,
            round: self.rs.round,
            timestamp: self.valid_time(),
            vote_type,
            block_id,
            signature: Signature::empty(),
        };
        let Some(signer) = self.signer.as_mut() else {
            return;
        };
        match signer.sign_vote(&self.state.chain_id, &mut vote) {
            Ok(()) => {
                debug!(
                    height = vote.height,
                    round = vote.round,
                    %vote_type,
                    block = %block_id.short(),
                    "signed vote"
                );
                self.send_internal(ConsensusMessage::Vote(vote));
            }
            Err(e) => error!(
                height = vote.height,
                round = vote.round,
                %vote_type,
                err = %e,
                "failed signing vote"
            ),
        }
    }

    /// Leaves replay mode: re-arms the last timeout and casts any own vote
    /// for the current step that did not make it into the log.
    pub(super) fn finish_replay(&mut self) {
        self.replay_mode = false;
        if let Some(ti) = self.deferred_timeout.take() {
            self.outputs.push(Output::ScheduleTimeout(ti));
        }

        let Some(address) = self.address else {
            return;
        };
        let round = self.rs.round;
        let voted = |vote_type| {
            self.rs
                .votes
                .vote_set(round, vote_type)
                .and_then(|set| set.get_by_address(&address))
                .is_some()
        };
        let (prevoted, precommitted) = (voted(VoteType::Prevote), voted(VoteType::Precommit));
        match self.rs.step {
            Step::Prevote | Step::PrevoteWait if !prevoted => {
                info!(height = self.rs.height, round, "casting prevote missing after replay");
                let target = self.prevote_target(round);
                self.sign_add_vote(VoteType::Prevote, target);
            }
            Step::Precommit | Step::PrecommitWait if !precommitted => {
                info!(height = self.rs.height, round, "casting precommit missing after replay");
                let target = self.precommit_target(round);
                self.sign_add_vote(VoteType::Precommit, target);
            }
            _ => {}
        }
    }
}
