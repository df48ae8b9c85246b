use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use round_bft::config::NodeConfig;
use round_bft::network::{Node, NodeSetup};
use round_bft::signer::{LocalSigner, Signer};
use round_bft::types::{ConsensusParams, GenesisDoc, GenesisValidator, Timestamp};

#[derive(Parser)]
#[command(name = "round-bft", version, about = "Round-based BFT validator")]
struct Cli {
    /// Node home directory.
    #[arg(long, default_value = ".round-bft")]
    home: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config, a validator key and a single-validator genesis.
    Init {
        #[arg(long, default_value = "node0")]
        moniker: String,
        #[arg(long, default_value = "round-bft-local")]
        chain_id: String,
    },
    /// Run the validator until Ctrl-C.
    Start,
}

fn init(home: PathBuf, moniker: &str, chain_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::new(&home, moniker);
    config.save()?;
    let signer = LocalSigner::load_or_generate(&config.key_path(), &config.sign_state_path())?;

    let genesis_path = config.genesis_path();
    if genesis_path.exists() {
        info!(path = %genesis_path.display(), "genesis already present");
        return Ok(());
    }
    if let Some(dir) = genesis_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let genesis = GenesisDoc {
        genesis_time: Timestamp::now(),
        chain_id: chain_id.to_string(),
        initial_height: 1,
        consensus_params: ConsensusParams::default(),
        validators: vec![GenesisValidator::new(&signer.public_key(), 10, moniker)],
        app_hash: String::new(),
    };
    genesis.validate()?;
    genesis.save_as(&genesis_path)?;
    info!(home = %home.display(), address = %signer.public_key().address(), "initialized node");
    Ok(())
}

async fn start(home: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::load(&home)?;
    let node = Node::start(NodeSetup::from_config(&config)?)?;
    info!(node = %node.id(), status = %node.status(), "node started");

    tokio::signal::ctrl_c().await?;
    let cs = node.stop().await?;
    info!(height = cs.chain_state().last_block_height, "node stopped");
    Ok(())
}

fn log_filter(home: &Path) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = NodeConfig::load(home)
        .map(|c| c.log_level)
        .unwrap_or_else(|_| "info".to_string());
    EnvFilter::new(level)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_env_filter(log_filter(&cli.home)).init();

    let result = match cli.command {
        Command::Init { moniker, chain_id } => init(cli.home, &moniker, &chain_id),
        Command::Start => start(cli.home).await,
    };
    if let Err(e) = result {
        error!(err = %e, "exiting");
        std::process::exit(1);
    }
}
