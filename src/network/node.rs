use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Envelope, NullPeerChannel, PeerChannel, PeerId, Reactor};
use crate::app::{AppConnection, KvStoreApp};
use crate::config::{ConsensusConfig, NodeConfig, SignerMode};
use crate::consensus::{
    ConsensusError, ConsensusEvent, ConsensusProcessor, ConsensusState, FileWal, HandshakeError, Handshaker,
    RoundStepSummary, Wal, WalError, MAILBOX_CAPACITY,
};
use crate::evidence::MemEvidencePool;
use crate::mempool::MemTxPool;
use crate::signer::{LocalSigner, RemoteSigner, Signer, SignerError, SignerServer};
use crate::state::{BlockExecutor, State, StateStore};
use crate::storage::{BlockStore, KvStore, RocksDb, StoreError};
use crate::types::{GenesisDoc, GenesisError};

const MEMPOOL_MAX_TXS: usize = 5000;
const MEMPOOL_MAX_TX_BYTES: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Genesis(#[from] GenesisError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("consensus task panicked: {0}")]
    Join(String),
}

/// Everything a validator needs before it can start.
pub struct NodeSetup {
    pub id: PeerId,
    pub config: ConsensusConfig,
    pub genesis: GenesisDoc,
    pub db: Arc<dyn KvStore>,
    pub wal: Box<dyn Wal>,
    pub app: Box<dyn AppConnection>,
    pub signer: Box<dyn Signer>,
    pub peers: Arc<dyn PeerChannel>,
    pub inbound: Option<mpsc::UnboundedReceiver<Envelope>>,
}

impl NodeSetup {
    /// A standalone validator from an on-disk home directory, running the
    /// built-in key-value application. A remote signer is spawned on the
    /// current tokio runtime.
    pub fn from_config(config: &NodeConfig) -> Result<NodeSetup, NodeError> {
        let genesis = GenesisDoc::from_file(config.genesis_path())?;
        let db = Arc::new(RocksDb::open(config.db_path())?);
        let wal = FileWal::open(config.wal_file())?;
        let local = LocalSigner::load_or_generate(&config.key_path(), &config.sign_state_path())?;
        let signer: Box<dyn Signer> = match config.signer {
            SignerMode::Local => Box::new(local),
            SignerMode::Remote => {
                let pub_key = local.public_key();
                let (server, endpoint) = SignerServer::new(local);
                tokio::spawn(server.run());
                debug!(timeout = ?config.consensus.sign_timeout(), "using remote signer");
                Box::new(RemoteSigner::new(endpoint, pub_key, config.consensus.sign_timeout()))
            }
        };
        Ok(NodeSetup {
            id: config.moniker.clone(),
            config: config.consensus.clone(),
            genesis,
            db,
            wal: Box::new(wal),
            app: Box::new(KvStoreApp::new()),
            signer,
            peers: Arc::new(NullPeerChannel),
            inbound: None,
        })
    }
}

/*
    A running validator: the consensus processor and, when connected to
    peers, the reactor feeding it. Both are tokio tasks sharing one
    shutdown signal. The mempool notifies the processor through a bridge
    task feeding the same mailbox the reactor and the timers use.
*/
pub struct Node {
    id: PeerId,
    mempool: Arc<MemTxPool>,
    evidence: Arc<MemEvidencePool>,
    block_store: BlockStore,
    status: watch::Receiver<RoundStepSummary>,
    shutdown: watch::Sender<bool>,
    consensus: JoinHandle<Result<ConsensusState, ConsensusError>>,
    reactor: Option<JoinHandle<()>>,
    bridge: JoinHandle<()>,
}

impl Node {
    /// Reconciles the application with the stores, then spawns the tasks.
    /// Must be called inside a tokio runtime.
    pub fn start(setup: NodeSetup) -> Result<Node, NodeError> {
        let NodeSetup {
            id,
            config,
            genesis,
            db,
            wal,
            app,
            signer,
            peers,
            inbound,
        } = setup;

        let state_store = StateStore::new(db.clone());
        let block_store = BlockStore::new(db);
        let state = match state_store.load()? {
            Some(state) => state,
            None => State::from_genesis(&genesis)?,
        };

        let mempool = Arc::new(MemTxPool::new(MEMPOOL_MAX_TXS, MEMPOOL_MAX_TX_BYTES));
        let evidence = Arc::new(MemEvidencePool::new(
            &genesis.chain_id,
            genesis.consensus_params.evidence.max_age,
        ));
        let mut executor = BlockExecutor::new(state_store.clone(), app, mempool.clone(), evidence.clone());

        let mut handshaker = Handshaker::new(state_store, block_store.clone());
        let state = handshaker.handshake(state, &mut executor)?;
        info!(
            node = %id,
            height = state.last_block_height,
            replayed = handshaker.blocks_replayed(),
            "handshake complete"
        );

        let flush_interval = config.wal_flush_interval();
        let mut cs = ConsensusState::new(config, state, executor, block_store.clone(), wal)?;
        cs.set_signer(signer);

        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let txs_available = Arc::new(Notify::new());
        let waker = txs_available.clone();
        mempool.set_txs_available(move || waker.notify_one());
        let bridge = tokio::spawn(forward_txs_available(
            txs_available,
            mailbox_tx.clone(),
            shutdown_rx.clone(),
        ));
        let reactor = inbound.map(|inbound| {
            let reactor = Reactor::new(mailbox_tx.clone());
            tokio::spawn(reactor.run(inbound, shutdown_rx.clone()))
        });
        let (processor, status) = ConsensusProcessor::new(cs, mailbox_tx, mailbox_rx, peers, flush_interval);
        let consensus = tokio::spawn(processor.run(shutdown_rx));

        Ok(Node {
            id,
            mempool,
            evidence,
            block_store,
            status,
            shutdown,
            consensus,
            reactor,
            bridge,
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn status(&self) -> RoundStepSummary {
        *self.status.borrow()
    }

    /// Watches the processor's (height, round, step).
    pub fn subscribe(&self) -> watch::Receiver<RoundStepSummary> {
        self.status.clone()
    }

    pub fn mempool(&self) -> &Arc<MemTxPool> {
        &self.mempool
    }

    pub fn evidence(&self) -> &Arc<MemEvidencePool> {
        &self.evidence
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    /// Lets the in-flight event finish, flushes the WAL and hands back the
    /// consensus state.
    pub async fn stop(self) -> Result<ConsensusState, NodeError> {
        info!(node = %self.id, status = %self.status(), "stopping node");
        if self.shutdown.send(true).is_err() {
            warn!(node = %self.id, "node tasks already gone");
        }
        if let Some(reactor) = self.reactor {
            if let Err(e) = reactor.await {
                warn!(node = %self.id, err = %e, "reactor task failed");
            }
        }
        if let Err(e) = self.bridge.await {
            warn!(node = %self.id, err = %e, "txs available bridge failed");
        }
        let cs = self.consensus.await.map_err(|e| NodeError::Join(e.to_string()))??;
        Ok(cs)
    }
}

/// Turns mempool notices into mailbox events. A notice raised while the
/// mailbox is full is held by the `Notify` permit and delivered once there
/// is room.
async fn forward_txs_available(
    notify: Arc<Notify>,
    mailbox: mpsc::Sender<ConsensusEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = notify.notified() => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    sent = mailbox.send(ConsensusEvent::TxsAvailable) => {
                        if sent.is_err() {
                            debug!("mailbox closed, txs available bridge stopping");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::consensus::{MemWal, Step, TimeoutInfo};
    use crate::state::test_helpers::{genesis, keypairs};
    use crate::storage::MemDb;

    #[tokio::test]
    async fn test_node_commits_submitted_tx() {
        let keys = keypairs(1);
        let app = KvStoreApp::new();
        let node = Node::start(NodeSetup {
            id: "solo".to_string(),
            config: ConsensusConfig {
                create_empty_blocks: false,
                ..ConsensusConfig::test_config()
            },
            genesis: genesis(&keys, &[1], 1),
            db: Arc::new(MemDb::new()),
            wal: Box::new(MemWal::new()),
            app: Box::new(app.clone()),
            signer: Box::new(LocalSigner::new(keys[0].clone())),
            peers: Arc::new(NullPeerChannel),
            inbound: None,
        })
        .unwrap();

        let mut status = node.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.height >= 2))
            .await
            .unwrap()
            .unwrap();

        node.mempool().check_tx(b"color=blue".to_vec()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.height >= 3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(app.get(b"color"), Some(b"blue".to_vec()));

        let cs = node.stop().await.unwrap();
        assert_eq!(cs.block_store().load_block(2).unwrap().unwrap().txs.len(), 1);
    }

    #[tokio::test]
    async fn test_txs_available_waits_for_mailbox_room() {
        let (tx, mut rx) = mpsc::channel(1);
        let busy = TimeoutInfo::new(Duration::from_millis(1), 1, 0, Step::Propose);
        tx.send(ConsensusEvent::Timeout(busy)).await.unwrap();

        let notify = Arc::new(Notify::new());
        let (stop, shutdown) = watch::channel(false);
        let bridge = tokio::spawn(forward_txs_available(notify.clone(), tx, shutdown));
        // raised while the mailbox is full
        notify.notify_one();
        tokio::task::yield_now().await;

        assert!(matches!(rx.recv().await, Some(ConsensusEvent::Timeout(_))));
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(next, Some(ConsensusEvent::TxsAvailable)));

        stop.send(true).unwrap();
        bridge.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_node_signs_through_remote_signer() {
        let keys = keypairs(1);
        let config = ConsensusConfig::test_config();
        let (server, endpoint) = SignerServer::new(LocalSigner::new(keys[0].clone()));
        tokio::spawn(server.run());
        let signer = RemoteSigner::new(endpoint, keys[0].pubkey(), config.sign_timeout());

        let node = Node::start(NodeSetup {
            id: "remote".to_string(),
            config,
            genesis: genesis(&keys, &[1], 1),
            db: Arc::new(MemDb::new()),
            wal: Box::new(MemWal::new()),
            app: Box::new(KvStoreApp::new()),
            signer: Box::new(signer),
            peers: Arc::new(NullPeerChannel),
            inbound: None,
        })
        .unwrap();

        let mut status = node.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.height >= 3))
            .await
            .unwrap()
            .unwrap();
        let cs = node.stop().await.unwrap();
        assert!(cs.chain_state().last_block_height >= 2);
    }
}
