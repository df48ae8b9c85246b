use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest as ShaDigest, Sha256};
use tracing::{debug, info};

use super::{
    AppConnection, AppError, AppQuery, RequestBeginBlock, RequestInitChain, ResponseCommit,
    ResponseDeliverTx, ResponseEndBlock, ResponseInfo, ResponseInitChain, ResponseQuery, CODE_OK,
};
use crate::common::crypto::{Hash, PublicKey};
use crate::types::{Height, ValidatorUpdate};

/// Result code for a malformed validator-update transaction.
pub const CODE_BAD_VALIDATOR_TX: u32 = 2;

const VALIDATOR_TX_PREFIX: &str = "val:";

#[derive(Default)]
struct Inner {
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Vec<u8>>,
    validator_updates: Vec<ValidatorUpdate>,
    height: Height,
    app_hash: Hash,
    in_block: Option<Height>,
    commit_calls: u64,
    deliver_tx_calls: u64,
}

/*
    In-process key/value application.

    Transactions are `key=value` (or a bare `key`, stored as its own value).
    `val:<hex pubkey>!<power>` returns a validator update at end of block.
    The app hash is the SHA-256 over the committed pairs, all zeros while
    the store is empty. A block without transactions leaves it unchanged.

    Clones share state, so a test can keep a handle while consensus owns
    the connection.
*/
#[derive(Clone, Default)]
pub struct KvStoreApp {
    inner: Arc<Mutex<Inner>>,
}

impl KvStoreApp {
    pub fn new() -> Self {
        KvStoreApp::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, AppError> {
        self.inner
            .lock()
            .map_err(|_| AppError::Internal("kvstore lock poisoned".to_string()))
    }

    pub fn commit_calls(&self) -> u64 {
        self.lock().map(|i| i.commit_calls).unwrap_or(0)
    }

    pub fn deliver_tx_calls(&self) -> u64 {
        self.lock().map(|i| i.deliver_tx_calls).unwrap_or(0)
    }

    pub fn height(&self) -> Height {
        self.lock().map(|i| i.height).unwrap_or(0)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lock().ok().and_then(|i| i.committed.get(key).cloned())
    }

    fn compute_hash(committed: &BTreeMap<Vec<u8>, Vec<u8>>) -> Hash {
        if committed.is_empty() {
            return [0u8; 32];
        }
        let mut hasher = Sha256::new();
        for (k, v) in committed {
            hasher.update((k.len() as u64).to_be_bytes());
            hasher.update(k);
            hasher.update((v.len() as u64).to_be_bytes());
            hasher.update(v);
        }
        hasher.finalize().into()
    }

    fn parse_validator_tx(body: &str) -> Option<ValidatorUpdate> {
        let (key_hex, power) = body.split_once('!')?;
        let power: i64 = power.parse().ok()?;
        let key: [u8; 32] = hex::decode(key_hex).ok()?.try_into().ok()?;
        Some(ValidatorUpdate {
            pub_key: PublicKey { key },
            power,
        })
    }
}

impl AppConnection for KvStoreApp {
    fn info(&mut self) -> Result<ResponseInfo, AppError> {
        let inner = self.lock()?;
        Ok(ResponseInfo {
            last_block_height: inner.height,
            last_block_app_hash: inner.app_hash,
        })
    }

    fn init_chain(&mut self, req: RequestInitChain) -> Result<ResponseInitChain, AppError> {
        info!(chain_id = %req.chain_id, validators = req.validators.len(), "kvstore init chain");
        Ok(ResponseInitChain::default())
    }

    fn begin_block(&mut self, req: RequestBeginBlock) -> Result<(), AppError> {
        let mut inner = self.lock()?;
        if let Some(open) = inner.in_block {
            return Err(AppError::OutOfOrder(format!("block {} still open", open)));
        }
        inner.in_block = Some(req.header.height);
        inner.pending.clear();
        inner.validator_updates.clear();
        Ok(())
    }

    fn deliver_tx(&mut self, tx: &[u8]) -> Result<ResponseDeliverTx, AppError> {
        let mut inner = self.lock()?;
        if inner.in_block.is_none() {
            return Err(AppError::OutOfOrder("deliver_tx outside block".to_string()));
        }
        inner.deliver_tx_calls += 1;

        let text = String::from_utf8_lossy(tx);
        if let Some(body) = text.strip_prefix(VALIDATOR_TX_PREFIX) {
            return Ok(match Self::parse_validator_tx(body) {
                Some(update) => {
                    inner.validator_updates.push(update);
                    ResponseDeliverTx {
                        code: CODE_OK,
                        ..ResponseDeliverTx::default()
                    }
                }
                None => ResponseDeliverTx {
                    code: CODE_BAD_VALIDATOR_TX,
                    log: format!("malformed validator tx {}", text),
                    ..ResponseDeliverTx::default()
                },
            });
        }

        let (key, value) = match tx.iter().position(|b| *b == b'=') {
            Some(i) => (tx[..i].to_vec(), tx[i + 1..].to_vec()),
            None => (tx.to_vec(), tx.to_vec()),
        };
        inner.pending.insert(key, value);
        Ok(ResponseDeliverTx {
            code: CODE_OK,
            gas_used: 1,
            ..ResponseDeliverTx::default()
        })
    }

    fn end_block(&mut self, height: Height) -> Result<ResponseEndBlock, AppError> {
        let inner = self.lock()?;
        if inner.in_block != Some(height) {
            return Err(AppError::OutOfOrder(format!("end_block {} without begin", height)));
        }
        Ok(ResponseEndBlock {
            validator_updates: inner.validator_updates.clone(),
            consensus_param_updates: None,
        })
    }

    fn commit(&mut self) -> Result<ResponseCommit, AppError> {
        let mut inner = self.lock()?;
        let height = inner
            .in_block
            .take()
            .ok_or_else(|| AppError::OutOfOrder("commit without block".to_string()))?;
        let pending = std::mem::take(&mut inner.pending);
        inner.committed.extend(pending);
        inner.height = height;
        inner.app_hash = Self::compute_hash(&inner.committed);
        inner.commit_calls += 1;
        debug!(height, app_hash = %hex::encode(&inner.app_hash[..6]), "kvstore committed");
        Ok(ResponseCommit {
            app_hash: inner.app_hash,
        })
    }
}

impl AppQuery for KvStoreApp {
    fn query(&mut self, _path: &str, data: &[u8]) -> Result<ResponseQuery, AppError> {
        let inner = self.lock()?;
        Ok(match inner.committed.get(data) {
            Some(value) => ResponseQuery {
                code: CODE_OK,
                value: value.clone(),
                log: "exists".to_string(),
                height: inner.height,
            },
            None => ResponseQuery {
                code: CODE_OK,
                log: "does not exist".to_string(),
                height: inner.height,
                ..ResponseQuery::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::LastCommitInfo;
    use crate::common::crypto::Keypair;
    use crate::types::Header;

    fn begin(app: &mut KvStoreApp, height: Height) {
        app.begin_block(RequestBeginBlock {
            hash: [0u8; 32],
            header: Header {
                height,
                ..Header::default()
            },
            last_commit_info: LastCommitInfo::default(),
            byzantine_validators: Vec::new(),
        })
        .unwrap();
    }

    #[test]
    fn test_block_lifecycle() {
        let mut app = KvStoreApp::new();
        begin(&mut app, 1);
        assert!(app.deliver_tx(b"name=satoshi").unwrap().is_ok());
        assert!(app.deliver_tx(b"bare").unwrap().is_ok());
        app.end_block(1).unwrap();
        let first = app.commit().unwrap().app_hash;

        assert_eq!(app.get(b"name"), Some(b"satoshi".to_vec()));
        assert_eq!(app.get(b"bare"), Some(b"bare".to_vec()));
        assert_eq!(app.info().unwrap().last_block_height, 1);
        assert_eq!(app.commit_calls(), 1);

        let value = app.query("/store", b"name").unwrap().value;
        assert_eq!(value, b"satoshi".to_vec());

        assert_ne!(first, [0u8; 32]);
        begin(&mut app, 2);
        app.end_block(2).unwrap();
        assert_eq!(app.commit().unwrap().app_hash, first);
        begin(&mut app, 3);
        app.deliver_tx(b"name=nakamoto").unwrap();
        app.end_block(3).unwrap();
        assert_ne!(app.commit().unwrap().app_hash, first);
    }

    #[test]
    fn test_validator_tx() {
        let mut app = KvStoreApp::new();
        let key = Keypair::from_seed(&[5u8; 32]).pubkey();
        begin(&mut app, 1);
        let tx = format!("val:{}!7", hex::encode(key.key));
        assert!(app.deliver_tx(tx.as_bytes()).unwrap().is_ok());
        assert_eq!(app.deliver_tx(b"val:zz!1").unwrap().code, CODE_BAD_VALIDATOR_TX);
        let res = app.end_block(1).unwrap();
        assert_eq!(res.validator_updates, vec![ValidatorUpdate { pub_key: key, power: 7 }]);
    }

    #[test]
    fn test_out_of_order_calls() {
        let mut app = KvStoreApp::new();
        assert!(app.deliver_tx(b"a=1").is_err());
        assert!(app.commit().is_err());
        begin(&mut app, 1);
        assert!(app.end_block(2).is_err());
    }
}
