use std::time::Duration;

use round_bft::config::NodeConfig;
use round_bft::network::{Node, NodeSetup};
use round_bft::signer::{LocalSigner, Signer};
use round_bft::state::StateStore;
use round_bft::storage::RocksDb;
use round_bft::types::{ConsensusParams, GenesisDoc, GenesisValidator, Hashable, Timestamp};

fn init_home(home: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::new(home, "solo");
    config.consensus.timeout_commit_ms = 10;
    config.consensus.skip_timeout_commit = true;
    config.consensus.wal_flush_interval_ms = 20;
    config.save().unwrap();

    let signer = LocalSigner::load_or_generate(&config.key_path(), &config.sign_state_path()).unwrap();
    let genesis = GenesisDoc {
        genesis_time: Timestamp(1_000),
        chain_id: "restart-chain".to_string(),
        initial_height: 1,
        consensus_params: ConsensusParams::default(),
        validators: vec![GenesisValidator::new(&signer.public_key(), 10, "solo")],
        app_hash: String::new(),
    };
    std::fs::create_dir_all(config.genesis_path().parent().unwrap()).unwrap();
    genesis.save_as(config.genesis_path()).unwrap();
    NodeConfig::load(home).unwrap()
}

async fn run_until(config: &NodeConfig, height: i64) -> i64 {
    let node = Node::start(NodeSetup::from_config(config).unwrap()).unwrap();
    let mut status = node.subscribe();
    tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| s.height >= height))
        .await
        .expect("node stalled")
        .unwrap();
    let cs = node.stop().await.unwrap();
    cs.chain_state().last_block_height
}

#[tokio::test]
async fn test_node_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = init_home(dir.path());

    let first = run_until(&config, 4).await;
    assert!(first >= 3);
    let block_hash = {
        let db = std::sync::Arc::new(RocksDb::open(config.db_path()).unwrap());
        let store = round_bft::storage::BlockStore::new(db);
        store.load_block(2).unwrap().unwrap().hash()
    };

    // the application is in memory, so the handshake replays every stored block
    let second = run_until(&config, first + 3).await;
    assert!(second >= first + 2);

    let db = std::sync::Arc::new(RocksDb::open(config.db_path()).unwrap());
    let store = round_bft::storage::BlockStore::new(db.clone());
    assert_eq!(store.load_block(2).unwrap().unwrap().hash(), block_hash);
    let state = StateStore::new(db).load().unwrap().unwrap();
    assert_eq!(state.last_block_height, store.height().unwrap());
}
