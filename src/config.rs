use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Round, Timestamp};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config encode error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Timeouts and block production policy for the consensus core. Durations are
/// in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub wal_path: String,

    pub timeout_propose_ms: u64,
    pub timeout_propose_delta_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,
    pub timeout_commit_ms: u64,

    /// Move to the next height as soon as all precommits are in.
    pub skip_timeout_commit: bool,

    pub create_empty_blocks: bool,
    pub create_empty_blocks_interval_ms: u64,

    pub sign_timeout_ms: u64,
    pub wal_flush_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            wal_path: "data/cs.wal/wal".to_string(),
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval_ms: 0,
            sign_timeout_ms: 1000,
            wal_flush_interval_ms: 2000,
        }
    }
}

fn scaled(base: u64, delta: u64, round: Round) -> Duration {
    let round = round.max(0) as u64;
    Duration::from_millis(base.saturating_add(delta.saturating_mul(round)))
}

impl ConsensusConfig {
    /// Short timeouts for in-process tests.
    pub fn test_config() -> Self {
        ConsensusConfig {
            timeout_propose_ms: 40,
            timeout_propose_delta_ms: 1,
            timeout_prevote_ms: 10,
            timeout_prevote_delta_ms: 1,
            timeout_precommit_ms: 10,
            timeout_precommit_delta_ms: 1,
            timeout_commit_ms: 10,
            skip_timeout_commit: true,
            sign_timeout_ms: 200,
            wal_flush_interval_ms: 50,
            ..ConsensusConfig::default()
        }
    }

    pub fn propose(&self, round: Round) -> Duration {
        scaled(self.timeout_propose_ms, self.timeout_propose_delta_ms, round)
    }

    pub fn prevote(&self, round: Round) -> Duration {
        scaled(self.timeout_prevote_ms, self.timeout_prevote_delta_ms, round)
    }

    pub fn precommit(&self, round: Round) -> Duration {
        scaled(self.timeout_precommit_ms, self.timeout_precommit_delta_ms, round)
    }

    /// Earliest start of the next height given the commit time of this one.
    pub fn commit(&self, t: Timestamp) -> Timestamp {
        t.add(Duration::from_millis(self.timeout_commit_ms))
    }

    pub fn empty_blocks_interval(&self) -> Duration {
        Duration::from_millis(self.create_empty_blocks_interval_ms)
    }

    /// Whether round 0 of a height waits for transactions before proposing.
    pub fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || self.create_empty_blocks_interval_ms > 0
    }

    pub fn sign_timeout(&self) -> Duration {
        Duration::from_millis(self.sign_timeout_ms)
    }

    pub fn wal_flush_interval(&self) -> Duration {
        Duration::from_millis(self.wal_flush_interval_ms)
    }

    /// WAL path, resolved against `home` when relative.
    pub fn wal_file(&self, home: &Path) -> PathBuf {
        let path = Path::new(&self.wal_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            home.join(path)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wal_path.is_empty() {
            return Err(ConfigError::Invalid("wal_path is empty".to_string()));
        }
        let nonzero = [
            ("timeout_propose_ms", self.timeout_propose_ms),
            ("timeout_prevote_ms", self.timeout_prevote_ms),
            ("timeout_precommit_ms", self.timeout_precommit_ms),
            ("sign_timeout_ms", self.sign_timeout_ms),
            ("wal_flush_interval_ms", self.wal_flush_interval_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Where the validator key is used. `Remote` runs the key behind a signer
/// task and bounds every request by `sign_timeout_ms`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerMode {
    #[default]
    Local,
    Remote,
}

/// On-disk node configuration, `<home>/config.toml`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(skip)]
    pub home: PathBuf,
    pub moniker: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_genesis_file")]
    pub genesis_file: String,
    #[serde(default = "default_key_file")]
    pub key_file: String,
    #[serde(default = "default_db_dir")]
    pub db_dir: String,
    #[serde(default)]
    pub signer: SignerMode,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_genesis_file() -> String {
    "config/genesis.json".to_string()
}

fn default_key_file() -> String {
    "config/priv_validator_key.json".to_string()
}

fn default_db_dir() -> String {
    "data".to_string()
}

pub const CONFIG_FILE: &str = "config.toml";

impl NodeConfig {
    pub fn new(home: &Path, moniker: &str) -> Self {
        NodeConfig {
            home: home.to_path_buf(),
            moniker: moniker.to_string(),
            log_level: default_log_level(),
            genesis_file: default_genesis_file(),
            key_file: default_key_file(),
            db_dir: default_db_dir(),
            signer: SignerMode::Local,
            consensus: ConsensusConfig::default(),
        }
    }

    pub fn load(home: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(home.join(CONFIG_FILE))?;
        let mut config: NodeConfig = toml::from_str(&text)?;
        config.home = home.to_path_buf();
        config.consensus.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.home)?;
        fs::write(self.home.join(CONFIG_FILE), toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn genesis_path(&self) -> PathBuf {
        self.home.join(&self.genesis_file)
    }

    pub fn key_path(&self) -> PathBuf {
        self.home.join(&self.key_file)
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join(&self.db_dir)
    }

    pub fn wal_file(&self) -> PathBuf {
        self.consensus.wal_file(&self.home)
    }

    /// Last-sign state of the validator key, kept next to the data.
    pub fn sign_state_path(&self) -> PathBuf {
        self.db_path().join("priv_validator_state.json")
    }
}
