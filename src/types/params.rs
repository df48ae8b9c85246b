use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};
use thiserror::Error;

use super::{Hashable, Height, Timestamp, Validator};
use crate::common::crypto::{Hash, PublicKey};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockSizeParams {
    pub max_bytes: i64,
    pub max_txs: i64,
    /// -1 means unlimited.
    pub max_gas: i64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EvidenceParams {
    /// Evidence older than this many heights is rejected.
    pub max_age: i64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub block_size: BlockSizeParams,
    pub evidence: EvidenceParams,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            block_size: BlockSizeParams {
                max_bytes: 22_020_096,
                max_txs: 10_000,
                max_gas: -1,
            },
            evidence: EvidenceParams { max_age: 100_000 },
        }
    }
}

/// Partial parameter change returned by the application at end of block.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ConsensusParamsUpdate {
    pub block_size: Option<BlockSizeParams>,
    pub evidence: Option<EvidenceParams>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("block_size.max_bytes must be positive, got {0}")]
    MaxBytes(i64),

    #[error("block_size.max_txs must be positive, got {0}")]
    MaxTxs(i64),

    #[error("block_size.max_gas must be >= -1, got {0}")]
    MaxGas(i64),

    #[error("evidence.max_age must be positive, got {0}")]
    MaxAge(i64),
}

impl ConsensusParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.block_size.max_bytes <= 0 {
            return Err(ParamsError::MaxBytes(self.block_size.max_bytes));
        }
        if self.block_size.max_txs <= 0 {
            return Err(ParamsError::MaxTxs(self.block_size.max_txs));
        }
        if self.block_size.max_gas < -1 {
            return Err(ParamsError::MaxGas(self.block_size.max_gas));
        }
        if self.evidence.max_age <= 0 {
            return Err(ParamsError::MaxAge(self.evidence.max_age));
        }
        Ok(())
    }

    pub fn update(&self, update: &ConsensusParamsUpdate) -> ConsensusParams {
        ConsensusParams {
            block_size: update.block_size.unwrap_or(self.block_size),
            evidence: update.evidence.unwrap_or(self.evidence),
        }
    }
}

impl Hashable for ConsensusParams {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.block_size.max_bytes.to_be_bytes());
        hasher.update(self.block_size.max_txs.to_be_bytes());
        hasher.update(self.block_size.max_gas.to_be_bytes());
        hasher.update(self.evidence.max_age.to_be_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("genesis io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("genesis json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid genesis: {0}")]
    Invalid(String),
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Hex-encoded ed25519 public key.
    pub pub_key: String,
    pub power: i64,
    #[serde(default)]
    pub name: String,
}

impl GenesisValidator {
    pub fn new(pub_key: &PublicKey, power: i64, name: &str) -> Self {
        GenesisValidator {
            pub_key: hex::encode(pub_key.key),
            power,
            name: name.to_string(),
        }
    }

    pub fn to_validator(&self) -> Result<Validator, GenesisError> {
        let bytes = hex::decode(&self.pub_key)
            .map_err(|e| GenesisError::Invalid(format!("pub_key of {}: {}", self.name, e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| GenesisError::Invalid(format!("pub_key of {} must be 32 bytes", self.name)))?;
        Ok(Validator::new(PublicKey { key }, self.power))
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub genesis_time: Timestamp,
    pub chain_id: String,
    #[serde(default = "default_initial_height")]
    pub initial_height: Height,
    #[serde(default)]
    pub consensus_params: ConsensusParams,
    pub validators: Vec<GenesisValidator>,
    /// Hex-encoded initial application hash.
    #[serde(default)]
    pub app_hash: String,
}

fn default_initial_height() -> Height {
    1
}

impl GenesisDoc {
    pub fn validate(&self) -> Result<(), GenesisError> {
        if self.chain_id.is_empty() {
            return Err(GenesisError::Invalid("chain_id is empty".to_string()));
        }
        if self.initial_height < 1 {
            return Err(GenesisError::Invalid(format!(
                "initial_height must be >= 1, got {}",
                self.initial_height
            )));
        }
        if self.validators.is_empty() {
            return Err(GenesisError::Invalid("no validators".to_string()));
        }
        for v in &self.validators {
            if v.power <= 0 {
                return Err(GenesisError::Invalid(format!("validator {} has no power", v.name)));
            }
            v.to_validator()?;
        }
        self.consensus_params
            .validate()
            .map_err(|e| GenesisError::Invalid(e.to_string()))?;
        self.app_hash_bytes()?;
        Ok(())
    }

    pub fn app_hash_bytes(&self) -> Result<Hash, GenesisError> {
        if self.app_hash.is_empty() {
            return Ok([0u8; 32]);
        }
        let bytes = hex::decode(&self.app_hash).map_err(|e| GenesisError::Invalid(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| GenesisError::Invalid("app_hash must be 32 bytes".to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GenesisError> {
        let data = fs::read(path)?;
        let doc: GenesisDoc = serde_json::from_slice(&data)?;
        doc.validate()?;
        Ok(doc)
    }

    pub fn save_as<P: AsRef<Path>>(&self, path: P) -> Result<(), GenesisError> {
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}
