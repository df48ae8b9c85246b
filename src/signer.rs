//! Validator signing identity.
//!
//! `LocalSigner` holds the ed25519 key in process. `RemoteSigner` forwards
//! requests to a `SignerServer` task and gives up after a bounded wait, so
//! a hung signer costs this validator its vote instead of halting it.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::common::crypto::{Keypair, PublicKey, Signature};
use crate::types::{Height, Proposal, Round, Vote, VoteType};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("conflicting data at {height}/{round}/{step}")]
    DoubleSign { height: Height, round: Round, step: u8 },

    #[error("height/round/step regression: {height}/{round}/{step} after {last_height}/{last_round}/{last_step}")]
    Regression {
        height: Height,
        round: Round,
        step: u8,
        last_height: Height,
        last_round: Round,
        last_step: u8,
    },

    #[error("signer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("signer disconnected")]
    Disconnected,

    #[error("remote signer error: {0}")]
    Remote(String),

    #[error("signer io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("signer key file error: {0}")]
    KeyFile(String),
}

pub trait Signer: Send {
    fn public_key(&self) -> PublicKey;

    /// Fills in `vote.signature`. May adjust `vote.timestamp` when re-signing
    /// a vote that was already signed with an earlier timestamp.
    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError>;

    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError>;
}

const STEP_PROPOSE: u8 = 1;
const STEP_PREVOTE: u8 = 2;
const STEP_PRECOMMIT: u8 = 3;

fn vote_step(vote_type: VoteType) -> u8 {
    match vote_type {
        VoteType::Prevote => STEP_PREVOTE,
        VoteType::Precommit => STEP_PRECOMMIT,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSignState {
    pub height: Height,
    pub round: Round,
    pub step: u8,
    pub sign_bytes: Vec<u8>,
    pub signature: Option<Signature>,
    pub timestamp: u64,
}

impl LastSignState {
    /// Returns true if (height, round, step) equals the last signed one.
    /// Errors if it is behind.
    fn check_hrs(&self, height: Height, round: Round, step: u8) -> Result<bool, SignerError> {
        let regression = SignerError::Regression {
            height,
            round,
            step,
            last_height: self.height,
            last_round: self.round,
            last_step: self.step,
        };
        if self.height > height {
            return Err(regression);
        }
        if self.height == height {
            if self.round > round {
                return Err(regression);
            }
            if self.round == round {
                if self.step > step {
                    return Err(regression);
                }
                if self.step == step {
                    return Ok(self.signature.is_some());
                }
            }
        }
        Ok(false)
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    pub_key: String,
    seed: String,
}

/// In-process signer with a double-sign guard.
///
/// The same (height, round, step) may be signed again only for identical
/// data, differing at most in timestamp; the earlier signature is returned.
pub struct LocalSigner {
    keypair: Keypair,
    last: LastSignState,
    state_file: Option<PathBuf>,
}

impl LocalSigner {
    pub fn new(keypair: Keypair) -> Self {
        LocalSigner {
            keypair,
            last: LastSignState::default(),
            state_file: None,
        }
    }

    /// Loads the key file, generating it if absent, and the persisted
    /// last-sign state alongside it.
    pub fn load_or_generate(key_file: &Path, state_file: &Path) -> Result<Self, SignerError> {
        let keypair = if key_file.exists() {
            let data = fs::read(key_file)?;
            let parsed: KeyFile =
                serde_json::from_slice(&data).map_err(|e| SignerError::KeyFile(e.to_string()))?;
            let seed: [u8; 32] = hex::decode(&parsed.seed)
                .map_err(|e| SignerError::KeyFile(e.to_string()))?
                .try_into()
                .map_err(|_| SignerError::KeyFile("seed must be 32 bytes".to_string()))?;
            Keypair::from_seed(&seed)
        } else {
            let keypair = Keypair::new_pair();
            Self::save_key(&keypair, key_file)?;
            keypair
        };
        let last = if state_file.exists() {
            let data = fs::read(state_file)?;
            serde_json::from_slice(&data).map_err(|e| SignerError::KeyFile(e.to_string()))?
        } else {
            LastSignState::default()
        };
        Ok(LocalSigner {
            keypair,
            last,
            state_file: Some(state_file.to_path_buf()),
        })
    }

    pub fn save_key(keypair: &Keypair, key_file: &Path) -> Result<(), SignerError> {
        if let Some(parent) = key_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = KeyFile {
            pub_key: hex::encode(keypair.pubkey().key),
            seed: hex::encode(keypair.seed()),
        };
        let data = serde_json::to_vec_pretty(&file).map_err(|e| SignerError::KeyFile(e.to_string()))?;
        fs::write(key_file, data)?;
        Ok(())
    }

    pub fn last_sign_state(&self) -> &LastSignState {
        &self.last
    }

    fn persist(&self) -> Result<(), SignerError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(&self.last).map_err(|e| SignerError::KeyFile(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn record(
        &mut self,
        height: Height,
        round: Round,
        step: u8,
        sign_bytes: Vec<u8>,
        signature: &Signature,
        timestamp: u64,
    ) -> Result<(), SignerError> {
        self.last = LastSignState {
            height,
            round,
            step,
            sign_bytes,
            signature: Some(signature.clone()),
            timestamp,
        };
        self.persist()
    }
}

impl Signer for LocalSigner {
    fn public_key(&self) -> PublicKey {
        self.keypair.pubkey()
    }

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        let step = vote_step(vote.vote_type);
        if self.last.check_hrs(vote.height, vote.round, step)? {
            let mut earlier = vote.clone();
            earlier.timestamp.0 = self.last.timestamp;
            if earlier.sign_bytes(chain_id) == self.last.sign_bytes {
                if let Some(sig) = &self.last.signature {
                    vote.timestamp = earlier.timestamp;
                    vote.signature = sig.clone();
                    return Ok(());
                }
            }
            return Err(SignerError::DoubleSign {
                height: vote.height,
                round: vote.round,
                step,
            });
        }
        let sign_bytes = vote.sign_bytes(chain_id);
        let signature = self.keypair.sign(&sign_bytes);
        self.record(vote.height, vote.round, step, sign_bytes, &signature, vote.timestamp.0)?;
        vote.signature = signature;
        Ok(())
    }

    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError> {
        if self.last.check_hrs(proposal.height, proposal.round, STEP_PROPOSE)? {
            let mut earlier = proposal.clone();
            earlier.timestamp.0 = self.last.timestamp;
            if earlier.sign_bytes(chain_id) == self.last.sign_bytes {
                if let Some(sig) = &self.last.signature {
                    proposal.timestamp = earlier.timestamp;
                    proposal.signature = sig.clone();
                    return Ok(());
                }
            }
            return Err(SignerError::DoubleSign {
                height: proposal.height,
                round: proposal.round,
                step: STEP_PROPOSE,
            });
        }
        let sign_bytes = proposal.sign_bytes(chain_id);
        let signature = self.keypair.sign(&sign_bytes);
        self.record(
            proposal.height,
            proposal.round,
            STEP_PROPOSE,
            sign_bytes,
            &signature,
            proposal.timestamp.0,
        )?;
        proposal.signature = signature;
        Ok(())
    }
}

#[derive(Debug)]
pub enum SignRequest {
    PubKey,
    SignVote { chain_id: String, vote: Vote },
    SignProposal { chain_id: String, proposal: Proposal },
}

#[derive(Debug)]
pub enum SignResponse {
    PubKey(PublicKey),
    SignedVote(Result<Vote, String>),
    SignedProposal(Result<Proposal, String>),
}

type Envelope = (SignRequest, oneshot::Sender<SignResponse>);

/// Client side of a signing endpoint.
#[derive(Clone)]
pub struct SignerEndpoint {
    requests: mpsc::UnboundedSender<Envelope>,
}

/// Serves sign requests from a `LocalSigner` as a tokio task.
pub struct SignerServer {
    signer: LocalSigner,
    requests: mpsc::UnboundedReceiver<Envelope>,
}

impl SignerServer {
    pub fn new(signer: LocalSigner) -> (Self, SignerEndpoint) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SignerServer { signer, requests: rx },
            SignerEndpoint { requests: tx },
        )
    }

    /// Runs until every endpoint handle is dropped.
    pub async fn run(mut self) {
        info!(address = %self.signer.public_key().address(), "signer server started");
        while let Some((request, reply)) = self.requests.recv().await {
            let response = self.handle(request);
            if reply.send(response).is_err() {
                debug!("sign requester went away before reply");
            }
        }
        debug!("signer server stopped");
    }

    fn handle(&mut self, request: SignRequest) -> SignResponse {
        match request {
            SignRequest::PubKey => SignResponse::PubKey(self.signer.public_key()),
            SignRequest::SignVote { chain_id, mut vote } => SignResponse::SignedVote(
                self.signer
                    .sign_vote(&chain_id, &mut vote)
                    .map(|_| vote)
                    .map_err(|e| e.to_string()),
            ),
            SignRequest::SignProposal { chain_id, mut proposal } => SignResponse::SignedProposal(
                self.signer
                    .sign_proposal(&chain_id, &mut proposal)
                    .map(|_| proposal)
                    .map_err(|e| e.to_string()),
            ),
        }
    }
}

/*
    Signer proxy with a bounded wait per request. The consensus loop calls
    signers synchronously, so the wait parks the calling worker with
    `block_in_place` on a multi-threaded runtime. Outside any runtime a
    throwaway current-thread runtime drives the timer. A current-thread
    runtime cannot serve the request while we wait, so it is refused.
*/
pub struct RemoteSigner {
    endpoint: SignerEndpoint,
    pub_key: PublicKey,
    timeout: Duration,
}

impl RemoteSigner {
    pub fn new(endpoint: SignerEndpoint, pub_key: PublicKey, timeout: Duration) -> Self {
        RemoteSigner {
            endpoint,
            pub_key,
            timeout,
        }
    }

    /// Asks the endpoint for its public key first.
    pub fn connect(endpoint: SignerEndpoint, timeout: Duration) -> Result<Self, SignerError> {
        let mut signer = RemoteSigner::new(endpoint, PublicKey { key: [0u8; 32] }, timeout);
        match signer.request(SignRequest::PubKey)? {
            SignResponse::PubKey(key) => {
                signer.pub_key = key;
                Ok(signer)
            }
            other => Err(SignerError::Remote(format!("unexpected response {:?}", other))),
        }
    }

    fn request(&self, request: SignRequest) -> Result<SignResponse, SignerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.endpoint
            .requests
            .send((request, reply_tx))
            .map_err(|_| SignerError::Disconnected)?;
        let timeout = self.timeout;
        match block_on(async move { tokio::time::timeout(timeout, reply_rx).await })? {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SignerError::Disconnected),
            Err(_) => {
                warn!(?timeout, "remote signer timed out");
                Err(SignerError::Timeout(timeout))
            }
        }
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output, SignerError> {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(future)))
        }
        Ok(_) => Err(SignerError::Remote(
            "remote signing needs a multi-threaded runtime".to_string(),
        )),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
            Ok(runtime.block_on(future))
        }
    }
}

impl Signer for RemoteSigner {
    fn public_key(&self) -> PublicKey {
        self.pub_key
    }

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        let request = SignRequest::SignVote {
            chain_id: chain_id.to_string(),
            vote: vote.clone(),
        };
        match self.request(request)? {
            SignResponse::SignedVote(Ok(signed)) => {
                *vote = signed;
                Ok(())
            }
            SignResponse::SignedVote(Err(e)) => Err(SignerError::Remote(e)),
            other => Err(SignerError::Remote(format!("unexpected response {:?}", other))),
        }
    }

    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError> {
        let request = SignRequest::SignProposal {
            chain_id: chain_id.to_string(),
            proposal: proposal.clone(),
        };
        match self.request(request)? {
            SignResponse::SignedProposal(Ok(signed)) => {
                *proposal = signed;
                Ok(())
            }
            SignResponse::SignedProposal(Err(e)) => Err(SignerError::Remote(e)),
            other => Err(SignerError::Remote(format!("unexpected response {:?}", other))),
        }
    }
}
