use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};
use thiserror::Error;

use super::{decode, encode, CodecError, Commit, Evidence, Hashable, Height, Timestamp};
use crate::common::{
    bits::BitArray,
    crypto::{Address, Hash},
    merkle,
};

/// Size of a single block part on the wire.
pub const BLOCK_PART_SIZE: usize = 65536;

/// Hard cap on a serialized block, whatever the consensus params say.
pub const MAX_BLOCK_SIZE_BYTES: usize = 104_857_600;

/// Most parts a part set header may announce.
pub const MAX_BLOCK_PARTS: u32 = (MAX_BLOCK_SIZE_BYTES / BLOCK_PART_SIZE) as u32 + 1;

pub type Tx = Vec<u8>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0
    }

    /// A header that a part set can be allocated for.
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.total == 0 {
            return Err("part set without parts".to_string());
        }
        if self.total > MAX_BLOCK_PARTS {
            return Err(format!("too many parts: {} > {}", self.total, MAX_BLOCK_PARTS));
        }
        Ok(())
    }
}

/// Identifies a block by its header hash and the parts it was split into.
/// The zero value means "nil": a vote for nothing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Hash,
    pub parts: PartSetHeader,
}

impl BlockId {
    pub fn nil() -> Self {
        BlockId::default()
    }

    pub fn is_nil(&self) -> bool {
        self.hash == [0u8; 32]
    }

    /// Nil ids carry no parts; any other id must announce a sane part set.
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.is_nil() {
            if !self.parts.is_zero() {
                return Err("nil block id with parts".to_string());
            }
            return Ok(());
        }
        self.parts.validate_basic()
    }

    pub fn short(&self) -> String {
        if self.is_nil() {
            "nil".to_string()
        } else {
            hex::encode_upper(&self.hash[..6])
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Header {
    pub chain_id: String,
    pub height: Height,
    pub time: Timestamp,
    pub num_txs: u64,
    pub total_txs: u64,
    pub last_block_id: BlockId,
    pub last_commit_hash: Hash,
    pub data_hash: Hash,
    pub validators_hash: Hash,
    pub consensus_hash: Hash,
    pub app_hash: Hash,
    pub last_results_hash: Hash,
    pub evidence_hash: Hash,
    pub proposer_address: Address,
}

impl Hashable for Header {
    fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update((self.chain_id.len() as u64).to_be_bytes());
        hasher.update(self.chain_id.as_bytes());
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.time.0.to_be_bytes());
        hasher.update(self.num_txs.to_be_bytes());
        hasher.update(self.total_txs.to_be_bytes());
        hasher.update(self.last_block_id.hash);
        hasher.update(self.last_block_id.parts.total.to_be_bytes());
        hasher.update(self.last_block_id.parts.hash);
        hasher.update(self.last_commit_hash);
        hasher.update(self.data_hash);
        hasher.update(self.validators_hash);
        hasher.update(self.consensus_hash);
        hasher.update(self.app_hash);
        hasher.update(self.last_results_hash);
        hasher.update(self.evidence_hash);
        hasher.update(self.proposer_address.0);
        hasher.finalize().into()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Tx>,
    pub evidence: Vec<Evidence>,
    pub last_commit: Commit,
}

impl Block {
    /// Builds a block and fills the header fields derived from its content.
    pub fn new(header: Header, txs: Vec<Tx>, evidence: Vec<Evidence>, last_commit: Commit) -> Self {
        let mut block = Block {
            header,
            txs,
            evidence,
            last_commit,
        };
        block.fill_header();
        block
    }

    pub fn fill_header(&mut self) {
        self.header.num_txs = self.txs.len() as u64;
        self.header.data_hash = merkle::root(&self.txs);
        self.header.last_commit_hash = self.last_commit.hash();
        let evidence_hashes: Vec<Hash> = self.evidence.iter().map(|e| e.hash()).collect();
        self.header.evidence_hash = merkle::root(&evidence_hashes);
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn hashes_to(&self, hash: &Hash) -> bool {
        &self.hash() == hash
    }

    pub fn make_part_set(&self, part_size: usize) -> Result<PartSet, CodecError> {
        let bytes = encode(self)?;
        Ok(PartSet::from_data(&bytes, part_size))
    }

    pub fn block_id(&self, part_size: usize) -> Result<BlockId, CodecError> {
        let parts = self.make_part_set(part_size)?;
        Ok(BlockId {
            hash: self.hash(),
            parts: parts.header(),
        })
    }

    pub fn from_parts(parts: &PartSet) -> Result<Block, CodecError> {
        decode(&parts.assemble())
    }

    /// Checks the derived header fields against the block content.
    pub fn validate_basic(&self) -> Result<(), String> {
        if self.header.num_txs != self.txs.len() as u64 {
            return Err(format!(
                "wrong num_txs: header {} actual {}",
                self.header.num_txs,
                self.txs.len()
            ));
        }
        if self.header.data_hash != merkle::root(&self.txs) {
            return Err("wrong data_hash".to_string());
        }
        if self.header.last_commit_hash != self.last_commit.hash() {
            return Err("wrong last_commit_hash".to_string());
        }
        let evidence_hashes: Vec<Hash> = self.evidence.iter().map(|e| e.hash()).collect();
        if self.header.evidence_hash != merkle::root(&evidence_hashes) {
            return Err("wrong evidence_hash".to_string());
        }
        Ok(())
    }
}

impl Hashable for Block {
    fn hash(&self) -> Hash {
        self.header.hash()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: merkle::Proof,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("part proof does not match part set hash")]
    InvalidProof,
}

/// A block split into merkle-proven parts.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    parts_bit_array: BitArray,
    count: u32,
}

impl PartSet {
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[][..]]
        } else {
            data.chunks(part_size.max(1)).collect()
        };
        let (root, proofs) = merkle::proofs(&chunks);
        let total = chunks.len() as u32;
        let mut parts_bit_array = BitArray::new(chunks.len());
        let parts = chunks
            .iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (chunk, proof))| {
                parts_bit_array.set(i, true);
                Some(Part {
                    index: i as u32,
                    bytes: chunk.to_vec(),
                    proof,
                })
            })
            .collect();
        PartSet {
            header: PartSetHeader { total, hash: root },
            parts,
            parts_bit_array,
            count: total,
        }
    }

    /// An empty part set waiting for parts matching `header`.
    pub fn from_header(header: PartSetHeader) -> Self {
        PartSet {
            header,
            parts: vec![None; header.total as usize],
            parts_bit_array: BitArray::new(header.total as usize),
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        &self.header == header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn bit_array(&self) -> &BitArray {
        &self.parts_bit_array
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Adds a part after checking its proof. Returns false for duplicates.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::IndexOutOfRange {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.parts[part.index as usize].is_some() {
            return Ok(false);
        }
        if part.proof.index != part.index as usize
            || part.proof.total != self.header.total as usize
            || !part.proof.verify(&self.header.hash, &part.bytes)
        {
            return Err(PartSetError::InvalidProof);
        }
        let index = part.index as usize;
        self.parts[index] = Some(part);
        self.parts_bit_array.set(index, true);
        self.count += 1;
        Ok(true)
    }

    pub fn assemble(&self) -> Vec<u8> {
        self.parts
            .iter()
            .flatten()
            .flat_map(|p| p.bytes.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let header = Header {
            chain_id: "test-chain".to_string(),
            height: 3,
            time: Timestamp(1_000),
            ..Header::default()
        };
        let txs = (0..50u32).map(|i| format!("key{}=value{}", i, i).into_bytes()).collect();
        Block::new(header, txs, Vec::new(), Commit::default())
    }

    #[test]
    fn test_part_set_reassembles_block() {
        let block = sample_block();
        let parts = block.make_part_set(64).unwrap();
        assert!(parts.total() > 1);

        let mut receiving = PartSet::from_header(parts.header());
        for i in (0..parts.total()).rev() {
            let part = parts.get_part(i).unwrap().clone();
            assert_eq!(receiving.add_part(part.clone()), Ok(true));
            assert_eq!(receiving.add_part(part), Ok(false));
        }
        assert!(receiving.is_complete());
        let decoded = Block::from_parts(&receiving).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.validate_basic().is_ok());
    }

    #[test]
    fn test_part_with_bad_proof_is_rejected() {
        let block = sample_block();
        let parts = block.make_part_set(64).unwrap();
        let mut receiving = PartSet::from_header(parts.header());

        let mut part = parts.get_part(0).unwrap().clone();
        part.bytes[0] ^= 0xff;
        assert_eq!(receiving.add_part(part), Err(PartSetError::InvalidProof));

        let mut part = parts.get_part(0).unwrap().clone();
        part.index = parts.total();
        assert!(matches!(
            receiving.add_part(part),
            Err(PartSetError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_header_hash_covers_fields() {
        let block = sample_block();
        let mut other = block.clone();
        other.header.app_hash = [1u8; 32];
        assert_ne!(block.hash(), other.hash());
    }

    #[test]
    fn test_validate_basic_detects_tampered_txs() {
        let mut block = sample_block();
        block.txs.push(b"extra=1".to_vec());
        assert!(block.validate_basic().is_err());
    }
}
