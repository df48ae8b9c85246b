//! The application boundary driven by consensus.
//!
//! A connection is strictly sequential: every call returns before the next
//! one is made. The application must be deterministic given identical inputs.

pub mod kvstore;

pub use kvstore::KvStoreApp;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::crypto::{Address, Hash};
use crate::types::{ConsensusParams, ConsensusParamsUpdate, Header, Height, ValidatorUpdate};

/// Transaction result code for success.
pub const CODE_OK: u32 = 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("application connection closed")]
    Closed,

    #[error("application error: {0}")]
    Internal(String),

    #[error("application called out of order: {0}")]
    OutOfOrder(String),
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub last_block_height: Height,
    pub last_block_app_hash: Hash,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RequestInitChain {
    pub chain_id: String,
    pub validators: Vec<ValidatorUpdate>,
    pub consensus_params: ConsensusParams,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ResponseInitChain {
    /// If non-empty, replaces the genesis validator set.
    pub validators: Vec<ValidatorUpdate>,
    pub consensus_params: Option<ConsensusParamsUpdate>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct VoteInfo {
    pub address: Address,
    pub power: i64,
    pub signed_last_block: bool,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct LastCommitInfo {
    pub round: i32,
    pub votes: Vec<VoteInfo>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Misbehavior {
    pub address: Address,
    pub height: Height,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RequestBeginBlock {
    pub hash: Hash,
    pub header: Header,
    pub last_commit_info: LastCommitInfo,
    pub byzantine_validators: Vec<Misbehavior>,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ResponseDeliverTx {
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
    pub gas_used: i64,
}

impl ResponseDeliverTx {
    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ResponseEndBlock {
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_param_updates: Option<ConsensusParamsUpdate>,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ResponseCommit {
    pub app_hash: Hash,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ResponseQuery {
    pub code: u32,
    pub value: Vec<u8>,
    pub log: String,
    pub height: Height,
}

/// Consensus connection to the application.
pub trait AppConnection: Send {
    fn info(&mut self) -> Result<ResponseInfo, AppError>;

    fn init_chain(&mut self, req: RequestInitChain) -> Result<ResponseInitChain, AppError>;

    fn begin_block(&mut self, req: RequestBeginBlock) -> Result<(), AppError>;

    fn deliver_tx(&mut self, tx: &[u8]) -> Result<ResponseDeliverTx, AppError>;

    fn end_block(&mut self, height: Height) -> Result<ResponseEndBlock, AppError>;

    fn commit(&mut self) -> Result<ResponseCommit, AppError>;
}

/// Read-only query connection.
pub trait AppQuery: Send {
    fn query(&mut self, path: &str, data: &[u8]) -> Result<ResponseQuery, AppError>;
}
