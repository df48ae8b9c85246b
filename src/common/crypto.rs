use std::fmt;

use ed25519_dalek::{ed25519::{self, signature::Signer}, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as ShaDigest, Sha256};

/// SHA-256 output used for block, part and merkle hashes.
pub type Hash = [u8; 32];

pub const ADDRESS_LEN: usize = 20;

pub fn sha256(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result[..]);
    digest
}

/// Validator address: the first 20 bytes of the SHA-256 of the public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(&self.0[..6]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

pub struct Keypair {
    pubkey: PublicKey,
    dalek_signer: SigningKey,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub key: [u8; 32],
}

#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    pub sig: [u8; 64],
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Deterministic keypair from a 32-byte seed (key files and tests).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(dalek_signer: SigningKey) -> Self {
        let pubkey = PublicKey::from(&dalek_signer.verifying_key().to_bytes());
        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.dalek_signer.sign(message).to_bytes();
        Signature { sig }
    }

    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }

    pub fn seed(&self) -> [u8; 32] {
        self.dalek_signer.to_bytes()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.seed())
    }
}

impl PublicKey {
    pub fn address(&self) -> Address {
        let digest = sha256(&self.key);
        let mut addr = [0u8; ADDRESS_LEN];
        addr.copy_from_slice(&digest[..ADDRESS_LEN]);
        Address(addr)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let dalek_sig = ed25519::Signature::from_bytes(&signature.sig);
        match VerifyingKey::from_bytes(&self.key) {
            Ok(dalek_pubkey) => dalek_pubkey.verify_strict(message, &dalek_sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode_upper(&self.key[..6]))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl From<&[u8; 32]> for PublicKey {
    fn from(bytes: &[u8; 32]) -> Self {
        PublicKey { key: *bytes }
    }
}

impl Signature {
    pub fn empty() -> Self {
        Signature { sig: [0u8; 64] }
    }

    pub fn is_empty(&self) -> bool {
        self.sig.iter().all(|b| *b == 0)
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", hex::encode_upper(&self.sig[..6]))
    }
}

// serde only derives arrays up to 32 elements.
impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.sig.iter())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        let sig: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Signature { sig })
    }
}
