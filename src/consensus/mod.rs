pub mod height_vote_set;
pub mod message;
pub mod processor;
pub mod replay;
pub mod round_state;
pub mod state;
pub mod timeout;
pub mod vote_set;
pub mod wal;

pub use height_vote_set::HeightVoteSet;
pub use message::{ConsensusMessage, MessageCodec, MsgInfo, MAX_MSG_SIZE, WIRE_VERSION};
pub use processor::{ConsensusProcessor, MAILBOX_CAPACITY};
pub use replay::{HandshakeError, Handshaker};
pub use round_state::{RoundState, RoundStepSummary, Step};
pub use state::{ConsensusError, ConsensusEvent, ConsensusState, Output};
pub use timeout::{TimeoutInfo, TimeoutScheduler};
pub use vote_set::{VoteError, VoteSet};
pub use wal::{FileWal, MemWal, NilWal, TimedWalMessage, Wal, WalError, WalMessage};

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use super::*;
    use crate::app::KvStoreApp;
    use crate::common::crypto::Keypair;
    use crate::config::ConsensusConfig;
    use crate::evidence::MemEvidencePool;
    use crate::mempool::MemTxPool;
    use crate::network::PeerId;
    use crate::signer::LocalSigner;
    use crate::state::test_helpers::{genesis, keypairs, CHAIN_ID};
    use crate::state::{BlockExecutor, State, StateStore};
    use crate::storage::{BlockStore, MemDb};
    use crate::types::{GenesisDoc, Timestamp};

    /// Validators with equal power sharing one genesis.
    pub struct Fixture {
        pub keys: Vec<Keypair>,
        pub genesis: GenesisDoc,
        pub config: ConsensusConfig,
    }

    /// One validator's state machine plus handles on everything it owns.
    pub struct TestNode {
        pub cs: ConsensusState,
        pub key: Keypair,
        pub app: KvStoreApp,
        pub mempool: Arc<MemTxPool>,
        pub evidence: Arc<MemEvidencePool>,
        pub db: Arc<MemDb>,
        pub wal: MemWal,
    }

    impl Fixture {
        pub fn new(n: usize) -> Self {
            let keys = keypairs(n);
            let genesis = genesis(&keys, &vec![1; n], 1);
            Fixture {
                keys,
                genesis,
                config: ConsensusConfig::test_config(),
            }
        }

        pub fn with_config(mut self, config: ConsensusConfig) -> Self {
            self.config = config;
            self
        }

        pub fn node(&self, index: usize) -> TestNode {
            self.restore(index, Arc::new(MemDb::new()), KvStoreApp::new(), MemWal::new())
        }

        /// A node rebuilt from existing stores, application and log.
        pub fn restore(&self, index: usize, db: Arc<MemDb>, app: KvStoreApp, wal: MemWal) -> TestNode {
            let state_store = StateStore::new(db.clone());
            let block_store = BlockStore::new(db.clone());
            let state = match state_store.load().unwrap() {
                Some(state) => state,
                None => State::from_genesis(&self.genesis).unwrap(),
            };
            let mempool = Arc::new(MemTxPool::new(1000, 1024));
            let evidence = Arc::new(MemEvidencePool::new(CHAIN_ID, 100));
            let mut executor = BlockExecutor::new(
                state_store.clone(),
                Box::new(app.clone()),
                mempool.clone(),
                evidence.clone(),
            );
            let state = Handshaker::new(state_store, block_store.clone())
                .handshake(state, &mut executor)
                .unwrap();
            let mut cs =
                ConsensusState::new(self.config.clone(), state, executor, block_store, Box::new(wal.clone())).unwrap();
            let key = self.keys[index].clone();
            cs.set_signer(Box::new(LocalSigner::new(key.clone())));
            TestNode {
                cs,
                key,
                app,
                mempool,
                evidence,
                db,
                wal,
            }
        }
    }

    pub fn peer_name(index: usize) -> PeerId {
        format!("node{}", index)
    }

    type Filter = Box<dyn Fn(usize, usize, &ConsensusMessage) -> bool>;

    /*
        Deterministic network of state machines on a fake clock. Messages
        are delivered in one global FIFO order, which keeps causality: a
        node never sees a message before the messages its sender had seen.
        Timers fire only when no message is in flight, earliest first.
    */
    pub struct Net {
        pub nodes: Vec<TestNode>,
        pub now: Timestamp,
        offline: Vec<bool>,
        queue: VecDeque<(usize, MsgInfo)>,
        timers: Vec<Option<(Timestamp, TimeoutInfo)>>,
        filter: Option<Filter>,
    }

    impl Net {
        pub fn new(nodes: Vec<TestNode>) -> Self {
            let n = nodes.len();
            Net {
                nodes,
                now: Timestamp(10_000),
                offline: vec![false; n],
                queue: VecDeque::new(),
                timers: vec![None; n],
                filter: None,
            }
        }

        /// Only messages for which `filter(from, to, msg)` holds are delivered.
        pub fn set_filter<F>(&mut self, filter: F)
        where
            F: Fn(usize, usize, &ConsensusMessage) -> bool + 'static,
        {
            self.filter = Some(Box::new(filter));
        }

        pub fn set_offline(&mut self, index: usize) {
            self.offline[index] = true;
        }

        pub fn online(&self) -> impl Iterator<Item = &TestNode> {
            self.nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !self.offline[*i])
                .map(|(_, node)| node)
        }

        pub fn start(&mut self) {
            for i in 0..self.nodes.len() {
                if !self.offline[i] {
                    self.nodes[i].cs.start(self.now).unwrap();
                    self.route(i);
                }
            }
        }

        pub fn inject(&mut self, to: usize, mi: MsgInfo) {
            self.queue.push_back((to, mi));
        }

        /// Applies an event to one node right away.
        pub fn deliver(&mut self, index: usize, event: ConsensusEvent) {
            self.nodes[index].cs.handle_event(event, self.now).unwrap();
            self.route(index);
        }

        fn route(&mut self, from: usize) {
            for output in self.nodes[from].cs.take_outputs() {
                match output {
                    Output::Broadcast(msg) => {
                        let gossiped = matches!(
                            msg,
                            ConsensusMessage::Proposal(_)
                                | ConsensusMessage::BlockPart { .. }
                                | ConsensusMessage::Vote(_)
                                | ConsensusMessage::VoteSetMaj23 { .. }
                        );
                        if !gossiped {
                            continue;
                        }
                        for to in 0..self.nodes.len() {
                            if to == from || self.offline[to] {
                                continue;
                            }
                            if let Some(filter) = &self.filter {
                                if !filter(from, to, &msg) {
                                    continue;
                                }
                            }
                            self.queue
                                .push_back((to, MsgInfo::from_peer(msg.clone(), peer_name(from))));
                        }
                    }
                    Output::SendTo(peer, msg) => {
                        if let Some(to) = (0..self.nodes.len()).find(|i| peer_name(*i) == peer) {
                            self.queue.push_back((to, MsgInfo::from_peer(msg, peer_name(from))));
                        }
                    }
                    Output::ScheduleTimeout(ti) => {
                        if let Some((_, pending)) = self.timers[from] {
                            if ti.is_before(&pending) {
                                continue;
                            }
                        }
                        self.timers[from] = Some((self.now.add(ti.duration()), ti));
                    }
                }
            }
        }

        /// Delivers the next message, or fires the earliest timer when none
        /// is in flight. False once nothing is left to do.
        pub fn step(&mut self) -> bool {
            if let Some((to, mi)) = self.queue.pop_front() {
                if !self.offline[to] {
                    self.deliver(to, ConsensusEvent::Message(mi));
                }
                return true;
            }
            let next = (0..self.nodes.len())
                .filter(|i| !self.offline[*i])
                .filter_map(|i| self.timers[i].map(|(at, ti)| (at, i, ti)))
                .min_by_key(|(at, i, _)| (*at, *i));
            let Some((at, i, ti)) = next else {
                return false;
            };
            self.timers[i] = None;
            self.now = self.now.max(at);
            self.deliver(i, ConsensusEvent::Timeout(ti));
            true
        }

        /// Delivers in-flight messages without firing timers.
        pub fn drain(&mut self) {
            while let Some((to, mi)) = self.queue.pop_front() {
                if !self.offline[to] {
                    self.deliver(to, ConsensusEvent::Message(mi));
                }
            }
        }

        pub fn run_until<F: Fn(&Net) -> bool>(&mut self, done: F) {
            for _ in 0..200_000 {
                if done(self) {
                    return;
                }
                assert!(self.step(), "network went idle");
            }
            panic!("condition not reached");
        }

        pub fn all_at_height(&self, height: i64) -> bool {
            self.online().all(|node| node.cs.round_state().height >= height)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::test_helpers::*;
    use super::*;
    use crate::common::crypto::{Address, Keypair};
    use crate::config::ConsensusConfig;
    use crate::consensus::vote_set::test_helpers::{block_id, signed_vote};
    use crate::evidence::EvidencePool;
    use crate::state::test_helpers::CHAIN_ID;
    use crate::types::{
        Block, BlockId, Commit, Evidence, Hashable, PartSet, Proposal, Round, Timestamp, ValidatorSet, VoteType,
        BLOCK_PART_SIZE,
    };

    fn index_of(cs: &ConsensusState, key: &Keypair) -> usize {
        cs.round_state()
            .validators
            .get_by_address(&key.pubkey().address())
            .unwrap()
            .0
    }

    fn proposer_node(net: &Net) -> usize {
        let proposer = net.nodes[0].cs.round_state().validators.proposer().unwrap().address;
        net.nodes
            .iter()
            .position(|node| node.key.pubkey().address() == proposer)
            .unwrap()
    }

    fn committed(node: &TestNode, height: i64) -> Block {
        node.cs.block_store().load_block(height).unwrap().unwrap()
    }

    #[test]
    fn test_four_validators_agree_on_five_heights() {
        let fixture = Fixture::new(4);
        let mut net = Net::new((0..4).map(|i| fixture.node(i)).collect());
        net.start();
        net.run_until(|net| net.all_at_height(6));

        for height in 1..=5 {
            let reference = committed(&net.nodes[0], height).hash();
            for node in &net.nodes {
                assert_eq!(committed(node, height).hash(), reference);
                let commit = node.cs.block_store().load_seen_commit(height).unwrap().unwrap();
                assert_eq!(commit.block_id.hash, reference);
            }
        }
        let app_hash = net.nodes[0].cs.chain_state().app_hash;
        assert!(net.nodes.iter().all(|n| n.cs.chain_state().app_hash == app_hash));
        for node in &net.nodes {
            // one application commit per block, none repeated
            assert_eq!(node.app.commit_calls() as i64, node.cs.chain_state().last_block_height);
        }
    }

    #[test]
    fn test_offline_proposer_moves_height_to_next_round() {
        let fixture = Fixture::new(4);
        let mut net = Net::new((0..4).map(|i| fixture.node(i)).collect());
        let absent = proposer_node(&net);
        net.set_offline(absent);
        net.start();
        net.run_until(|net| net.all_at_height(2));

        let node = net.online().next().unwrap();
        let commit = node.cs.block_store().load_seen_commit(1).unwrap().unwrap();
        assert_eq!(commit.round(), 1);
        let block = committed(node, 1);
        assert_ne!(block.header.proposer_address, net.nodes[absent].key.pubkey().address());
    }

    #[test]
    fn test_split_prevotes_precommit_nil_after_wait() {
        let fixture = Fixture::new(4);
        let mut net = Net::new((0..4).map(|i| fixture.node(i)).collect());
        let proposer = proposer_node(&net);
        let favoured = (proposer + 1) % 4;
        // only one other validator sees the round 0 proposal
        net.set_filter(move |from, to, msg| {
            let data = matches!(msg, ConsensusMessage::Proposal(_) | ConsensusMessage::BlockPart { .. });
            !(data && from == proposer && to != favoured && msg.height() == 1 && round_of(msg) == Some(0))
        });
        net.start();
        net.run_until(|net| net.online().all(|n| n.cs.round_state().round >= 1));

        for node in &net.nodes {
            let rs = node.cs.round_state();
            assert_eq!(rs.height, 1);
            assert_eq!(rs.locked_round, -1);
            assert_eq!(rs.votes.prevotes(0).unwrap().two_thirds_majority(), None);
            let own = rs.votes.precommits(0).unwrap().get_by_address(&node.key.pubkey().address());
            assert!(own.unwrap().block_id.is_nil());
        }

        net.run_until(|net| net.all_at_height(2));
        let commit = net.nodes[0].cs.block_store().load_seen_commit(1).unwrap().unwrap();
        assert!(commit.round() >= 1);
    }

    fn round_of(msg: &ConsensusMessage) -> Option<Round> {
        match msg {
            ConsensusMessage::Proposal(p) => Some(p.round),
            ConsensusMessage::BlockPart { round, .. } => Some(*round),
            _ => None,
        }
    }

    #[test]
    fn test_conflicting_votes_become_evidence() {
        let fixture = Fixture::new(4);
        let mut net = Net::new((0..4).map(|i| fixture.node(i)).collect());
        let byzantine = (proposer_node(&net) + 1) % 4;
        let key = fixture.keys[byzantine].clone();
        let index = index_of(&net.nodes[0].cs, &key);
        let forged = signed_vote(CHAIN_ID, &key, index, 1, 0, VoteType::Prevote, BlockId::nil());
        for to in (0..4).filter(|i| *i != byzantine) {
            net.inject(to, MsgInfo::from_peer(ConsensusMessage::Vote(forged.clone()), peer_name(byzantine)));
        }
        net.start();
        net.run_until(|net| net.all_at_height(5));

        let reference = committed(&net.nodes[0], 1).hash();
        assert!(net.nodes.iter().all(|n| committed(n, 1).hash() == reference));

        let address = key.pubkey().address();
        let included: usize = (2..=4)
            .map(|h| committed(&net.nodes[0], h))
            .map(|block| {
                block
                    .evidence
                    .iter()
                    .filter(|ev| matches!(ev, Evidence::DuplicateVote { .. }) && ev.address() == address)
                    .count()
            })
            .sum();
        assert_eq!(included, 1);
        assert!(net.nodes.iter().all(|n| n.evidence.pending_evidence(10).is_empty()));
    }

    #[test]
    fn test_future_round_prevotes_skip_ahead() {
        let fixture = Fixture::new(4);
        let mut net = Net::new(vec![fixture.node(0)]);
        net.start();
        net.step();
        assert_eq!(net.nodes[0].cs.round_state().round, 0);

        for (i, key) in fixture.keys.iter().enumerate().skip(1) {
            let index = index_of(&net.nodes[0].cs, key);
            let vote = signed_vote(CHAIN_ID, key, index, 1, 2, VoteType::Prevote, BlockId::nil());
            net.inject(0, MsgInfo::from_peer(ConsensusMessage::Vote(vote), peer_name(i)));
        }
        net.drain();
        assert_eq!(net.nodes[0].cs.round_state().round, 2);
    }

    // ---- hostile input ----

    fn key_of<'a>(fixture: &'a Fixture, address: &Address) -> &'a Keypair {
        fixture
            .keys
            .iter()
            .find(|key| key.pubkey().address() == *address)
            .unwrap()
    }

    /// A validator that does not propose in round 0.
    fn non_proposer(fixture: &Fixture) -> TestNode {
        let node = fixture.node(0);
        let proposer = node.cs.round_state().validators.proposer().unwrap().address;
        if node.key.pubkey().address() == proposer {
            fixture.node(1)
        } else {
            node
        }
    }

    fn from_peer(cs: &mut ConsensusState, msg: ConsensusMessage) {
        cs.handle_event(ConsensusEvent::Message(MsgInfo::from_peer(msg, "peer".to_string())), NOW)
            .unwrap();
    }

    const NOW: Timestamp = Timestamp(10_000);

    #[test]
    fn test_vote_at_extreme_height_is_ignored() {
        let fixture = Fixture::new(4);
        let mut node = non_proposer(&fixture);
        node.cs.start(NOW).unwrap();
        let before = node.cs.round_state().summary();

        let other = fixture.keys.iter().find(|k| k.pubkey().address() != node.key.pubkey().address()).unwrap();
        let index = index_of(&node.cs, other);
        for vote_type in [VoteType::Prevote, VoteType::Precommit] {
            let vote = signed_vote(CHAIN_ID, other, index, i64::MAX, 0, vote_type, BlockId::nil());
            from_peer(&mut node.cs, ConsensusMessage::Vote(vote));
        }

        assert_eq!(node.cs.round_state().summary(), before);
        assert!(node.cs.round_state().votes.prevotes(0).unwrap().get_by_index(index).is_none());
    }

    #[test]
    fn test_proposal_with_impossible_part_count_is_dropped() {
        let fixture = Fixture::new(4);
        let mut node = non_proposer(&fixture);
        node.cs.start(NOW).unwrap();
        let proposer = node.cs.round_state().validators.proposer().unwrap().address;
        let key = key_of(&fixture, &proposer);

        // the first is within the hard cap but above what the params allow
        for total in [1_000, 20_000_000] {
            let mut id = block_id(9);
            id.parts.total = total;
            let mut proposal = Proposal::new(1, 0, -1, id, Timestamp(2_000));
            proposal.signature = key.sign(&proposal.sign_bytes(CHAIN_ID));
            from_peer(&mut node.cs, ConsensusMessage::Proposal(proposal));

            let rs = node.cs.round_state();
            assert!(rs.proposal.is_none());
            assert!(rs.proposal_block_parts.is_none());
        }
    }

    struct Proposed {
        proposal: Proposal,
        parts: PartSet,
        block_id: BlockId,
    }

    fn signed_proposal(fixture: &Fixture, cs: &ConsensusState, proposers: &ValidatorSet, round: Round, tx: &[u8]) -> Proposed {
        let proposer = proposers.advanced(round as u32).proposer().unwrap().address;
        let block = cs
            .chain_state()
            .make_block(1, vec![tx.to_vec()], Commit::default(), Vec::new(), proposer, Timestamp(2_000));
        let parts = block.make_part_set(BLOCK_PART_SIZE).unwrap();
        let block_id = BlockId {
            hash: block.hash(),
            parts: parts.header(),
        };
        let mut proposal = Proposal::new(1, round, -1, block_id, Timestamp(2_000));
        proposal.signature = key_of(fixture, &proposer).sign(&proposal.sign_bytes(CHAIN_ID));
        Proposed {
            proposal,
            parts,
            block_id,
        }
    }

    fn send_proposal(cs: &mut ConsensusState, proposed: &Proposed) {
        let round = proposed.proposal.round;
        from_peer(cs, ConsensusMessage::Proposal(proposed.proposal.clone()));
        for i in 0..proposed.parts.total() {
            let part = proposed.parts.get_part(i).unwrap().clone();
            from_peer(cs, ConsensusMessage::BlockPart { height: 1, round, part });
        }
    }

    fn send_votes(cs: &mut ConsensusState, keys: &[&Keypair], round: Round, vote_type: VoteType, block_id: BlockId) {
        for key in keys {
            let index = index_of(cs, key);
            let vote = signed_vote(CHAIN_ID, key, index, 1, round, vote_type, block_id);
            from_peer(cs, ConsensusMessage::Vote(vote));
        }
    }

    #[test]
    fn test_relock_on_later_polka_through_messages() {
        let fixture = Fixture::new(4);
        let round0 = fixture.node(0).cs.round_state().validators.clone();
        // proposes in none of rounds 0 to 2
        let me = round0.advanced(3).proposer().unwrap().address;
        let index = fixture.keys.iter().position(|k| k.pubkey().address() == me).unwrap();
        let mut node = fixture.node(index);
        let others: Vec<&Keypair> = fixture.keys.iter().filter(|k| k.pubkey().address() != me).collect();

        let cs = &mut node.cs;
        cs.start(NOW).unwrap();
        if cs.round_state().step == Step::NewHeight {
            let ti = cs.pending_timeout().unwrap();
            cs.handle_event(ConsensusEvent::Timeout(ti), NOW).unwrap();
        }
        assert_eq!(cs.round_state().step, Step::Propose);

        // round 0: our prevote plus two more lock block a
        let a = signed_proposal(&fixture, cs, &round0, 0, b"a=1");
        send_proposal(cs, &a);
        send_votes(cs, &others[..2], 0, VoteType::Prevote, a.block_id);
        assert_eq!(cs.round_state().locked_round, 0);
        assert_eq!(cs.round_state().locked_block_id(), Some(a.block_id));

        // round 2: the others prevote b before we have seen it
        let b = signed_proposal(&fixture, cs, &round0, 2, b"b=2");
        send_votes(cs, &others, 2, VoteType::Prevote, b.block_id);
        assert_eq!(cs.round_state().round, 2);
        assert_eq!(cs.round_state().locked_round, 0);

        send_proposal(cs, &b);
        let rs = cs.round_state();
        assert_eq!(rs.locked_round, 2);
        assert_eq!(rs.locked_block_id(), Some(b.block_id));
        let own = |vote_type: VoteType| {
            let votes = match vote_type {
                VoteType::Prevote => rs.votes.prevotes(2),
                VoteType::Precommit => rs.votes.precommits(2),
            };
            votes.unwrap().get_by_address(&me).unwrap().block_id
        };
        // the proposal carries no pol round, so the lock on a still decides the prevote
        assert!(own(VoteType::Prevote).is_nil());
        assert_eq!(own(VoteType::Precommit), b.block_id);

        send_votes(cs, &others[..2], 2, VoteType::Precommit, b.block_id);
        assert_eq!(cs.chain_state().last_block_height, 1);
        assert_eq!(cs.block_store().load_block(1).unwrap().unwrap().hash(), b.block_id.hash);
    }

    // ---- locking ----

    fn make_block(cs: &ConsensusState, tx: &[u8]) -> (Block, PartSet, BlockId) {
        let proposer = cs.round_state().validators.proposer().unwrap().address;
        let block = cs
            .chain_state()
            .make_block(1, vec![tx.to_vec()], Commit::default(), Vec::new(), proposer, Timestamp(2_000));
        let parts = block.make_part_set(BLOCK_PART_SIZE).unwrap();
        let block_id = BlockId {
            hash: block.hash(),
            parts: parts.header(),
        };
        (block, parts, block_id)
    }

    fn polka(cs: &mut ConsensusState, keys: &[Keypair], round: Round, block_id: BlockId) {
        for key in keys.iter().take(3) {
            let index = index_of(cs, key);
            let vote = signed_vote(CHAIN_ID, key, index, 1, round, VoteType::Prevote, block_id);
            cs.rs.votes.add_vote(vote, None).unwrap();
        }
    }

    fn propose(cs: &mut ConsensusState, round: Round, pol_round: Round, block: &(Block, PartSet, BlockId)) {
        cs.rs.proposal = Some(Proposal::new(1, round, pol_round, block.2, Timestamp(2_000)));
        cs.rs.proposal_block = Some(block.0.clone());
        cs.rs.proposal_block_parts = Some(block.1.clone());
    }

    fn lock(cs: &mut ConsensusState, round: Round, block: &(Block, PartSet, BlockId)) {
        cs.rs.locked_round = round;
        cs.rs.locked_block = Some(block.0.clone());
        cs.rs.locked_block_parts = Some(block.1.clone());
    }

    fn at_round(cs: &mut ConsensusState, round: Round) {
        cs.rs.round = round;
        cs.rs.votes.set_round(round);
    }

    #[test]
    fn test_locked_validator_prevotes_its_lock() {
        let fixture = Fixture::new(4);
        let mut node = fixture.node(0);
        let cs = &mut node.cs;
        let a = make_block(cs, b"a=1");
        let b = make_block(cs, b"b=2");

        at_round(cs, 3);
        polka(cs, &fixture.keys, 2, a.2);
        lock(cs, 2, &a);

        propose(cs, 3, 2, &a);
        assert_eq!(cs.prevote_target(3), a.2);

        propose(cs, 3, -1, &b);
        assert!(cs.prevote_target(3).is_nil());

        // a pol round whose polka is for the locked block does not unlock
        propose(cs, 3, 2, &b);
        assert!(cs.prevote_target(3).is_nil());
    }

    #[test]
    fn test_later_polka_unlocks() {
        let fixture = Fixture::new(4);
        let mut node = fixture.node(0);
        let cs = &mut node.cs;
        let a = make_block(cs, b"a=1");
        let b = make_block(cs, b"b=2");

        at_round(cs, 3);
        polka(cs, &fixture.keys, 1, a.2);
        polka(cs, &fixture.keys, 2, b.2);
        lock(cs, 1, &a);

        propose(cs, 3, 2, &b);
        assert_eq!(cs.prevote_target(3), b.2);

        // not later than the lock
        propose(cs, 3, 1, &b);
        assert!(cs.prevote_target(3).is_nil());

        // no polka at the claimed round
        propose(cs, 3, 0, &b);
        cs.rs.locked_round = -1;
        cs.rs.locked_block = None;
        cs.rs.locked_block_parts = None;
        assert_eq!(cs.prevote_target(3), b.2);
    }

    #[test]
    fn test_nil_polka_keeps_lock() {
        let fixture = Fixture::new(4);
        let mut node = fixture.node(0);
        let cs = &mut node.cs;
        let a = make_block(cs, b"a=1");

        at_round(cs, 0);
        polka(cs, &fixture.keys, 0, a.2);
        propose(cs, 0, -1, &a);
        assert_eq!(cs.precommit_target(0), a.2);
        assert_eq!(cs.rs.locked_round, 0);

        at_round(cs, 1);
        polka(cs, &fixture.keys, 1, BlockId::nil());
        assert!(cs.precommit_target(1).is_nil());
        assert_eq!(cs.rs.locked_round, 0);
        assert_eq!(cs.rs.locked_block_id(), Some(a.2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn lock_round_never_decreases(ops in prop::collection::vec(0u8..6, 1..8)) {
            let fixture = Fixture::new(4);
            let mut node = fixture.node(0);
            let cs = &mut node.cs;
            let a = make_block(cs, b"a=1");
            let b = make_block(cs, b"b=2");

            for (round, op) in ops.into_iter().enumerate() {
                let round = round as Round;
                at_round(cs, round);
                let (polka_for, have) = match op {
                    0 => (None, false),
                    1 => (Some(BlockId::nil()), false),
                    2 => (Some(a.2), true),
                    3 => (Some(a.2), false),
                    4 => (Some(b.2), true),
                    _ => (Some(b.2), false),
                };
                if let Some(id) = polka_for {
                    polka(cs, &fixture.keys, round, id);
                }
                let proposed = if !have {
                    None
                } else if polka_for == Some(a.2) {
                    Some(&a)
                } else {
                    Some(&b)
                };
                cs.rs.proposal_block = proposed.map(|p| p.0.clone());
                cs.rs.proposal_block_parts = proposed.map(|p| p.1.clone());

                let before = (cs.rs.locked_round, cs.rs.locked_block_id());
                let target = cs.precommit_target(round);
                let after = (cs.rs.locked_round, cs.rs.locked_block_id());

                prop_assert!(after.0 >= before.0);
                if after.1 != before.1 {
                    prop_assert!(have);
                    prop_assert_eq!(after.1, polka_for);
                    prop_assert_eq!(after.0, round);
                }
                if !target.is_nil() {
                    prop_assert_eq!(Some(target), after.1);
                    prop_assert_eq!(Some(target), polka_for);
                }
                if polka_for.map_or(true, |id| id.is_nil()) {
                    prop_assert_eq!(after, before);
                }
            }
        }
    }

    // ---- recovery ----

    #[test]
    fn test_replay_rebuilds_round_state() {
        let config = ConsensusConfig {
            skip_timeout_commit: false,
            ..ConsensusConfig::test_config()
        };
        let fixture = Fixture::new(4).with_config(config);
        let mut net = Net::new((0..4).map(|i| fixture.node(i)).collect());
        net.start();
        net.run_until(|net| {
            let rs = net.nodes[0].cs.round_state();
            rs.height == 6 && rs.step >= Step::Prevote
        });

        let before = net.nodes[0].cs.round_state().clone();
        let node = &net.nodes[0];
        let commits = node.app.commit_calls();
        let mut restored = fixture.restore(0, node.db.clone(), node.app.clone(), node.wal.clone());
        restored.cs.start(net.now).unwrap();

        let mut after = restored.cs.round_state().clone();
        assert_eq!(restored.app.commit_calls(), commits);
        let committed_id = |rs: &RoundState| rs.last_commit.as_ref().and_then(|c| c.make_commit()).map(|c| c.block_id);
        assert_eq!(committed_id(&after), committed_id(&before));
        after.start_time = before.start_time;
        after.commit_time = before.commit_time;
        after.last_commit = before.last_commit.clone();
        assert_eq!(after, before);
    }

    #[test]
    fn test_wal_with_end_of_current_height_is_refused() {
        let fixture = Fixture::new(1);
        let mut node = fixture.node(0);
        let marker = TimedWalMessage {
            time: Timestamp(1),
            msg: WalMessage::EndHeight(1),
        };
        node.wal.write(marker).unwrap();
        let result = node.cs.catchup_replay(1);
        assert!(matches!(result, Err(ConsensusError::Replay(_))));
    }

    // ---- empty blocks ----

    fn no_empty_blocks(skip_timeout_commit: bool) -> ConsensusConfig {
        ConsensusConfig {
            create_empty_blocks: false,
            skip_timeout_commit,
            ..ConsensusConfig::test_config()
        }
    }

    fn waiting_at(net: &Net, height: i64) -> bool {
        let rs = net.nodes[0].cs.round_state();
        rs.height == height && rs.step == Step::NewRound
    }

    #[test]
    fn test_waits_for_txs_unless_proof_block_needed() {
        let fixture = Fixture::new(1).with_config(no_empty_blocks(true));
        let mut net = Net::new(vec![fixture.node(0)]);
        net.start();
        net.run_until(|net| waiting_at(net, 2));
        while net.step() {}
        assert!(waiting_at(&net, 2));
        assert_eq!(committed(&net.nodes[0], 1).txs.len(), 0);

        net.nodes[0].mempool.check_tx(b"k=v".to_vec()).unwrap();
        net.deliver(0, ConsensusEvent::TxsAvailable);

        // the app hash changed in block 2, so block 3 is made without txs
        net.run_until(|net| waiting_at(net, 4));
        while net.step() {}
        assert!(waiting_at(&net, 4));
        assert_eq!(committed(&net.nodes[0], 2).txs, vec![b"k=v".to_vec()]);
        assert_eq!(committed(&net.nodes[0], 3).txs.len(), 0);
    }

    #[test]
    fn test_interval_timeout_makes_empty_block() {
        let config = ConsensusConfig {
            create_empty_blocks_interval_ms: 1_000,
            ..ConsensusConfig::test_config()
        };
        let fixture = Fixture::new(1).with_config(config);
        let mut net = Net::new(vec![fixture.node(0)]);
        net.start();
        net.run_until(|net| waiting_at(net, 2));
        let waited_from = net.now;

        net.run_until(|net| waiting_at(net, 3));
        let block = committed(&net.nodes[0], 2);
        assert_eq!(block.txs.len(), 0);
        assert!(block.header.time.0 >= waited_from.0 + 1_000);

        net.nodes[0].mempool.check_tx(b"k=v".to_vec()).unwrap();
        net.deliver(0, ConsensusEvent::TxsAvailable);
        net.run_until(|net| net.all_at_height(4));
        assert_eq!(committed(&net.nodes[0], 3).txs.len(), 1);
    }

    #[test]
    fn test_pending_txs_propose_without_notification() {
        let fixture = Fixture::new(1).with_config(no_empty_blocks(false));
        let mut net = Net::new(vec![fixture.node(0)]);
        net.start();
        net.run_until(|net| {
            let rs = net.nodes[0].cs.round_state();
            rs.height == 2 && rs.step == Step::NewHeight
        });

        net.nodes[0].mempool.check_tx(b"k=v".to_vec()).unwrap();
        net.run_until(|net| net.all_at_height(3));
        assert_eq!(committed(&net.nodes[0], 2).txs.len(), 1);
    }
}
