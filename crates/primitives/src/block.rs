//! Sidechain block type and canonical hashing.

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::amount::Amount;
use crate::buf::Buf32;
use crate::crypto;
use crate::errors::CryptoError;
use crate::hash;
use crate::tx::Transaction;

/// A sidechain block, bound one-to-one to the upstream block at height
/// `steem_block`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "_id")]
    pub id: u64,

    /// Hash of the previous block.
    pub phash: String,

    /// Production timestamp, ms since epoch.
    pub timestamp: u64,

    /// Upstream block this one mirrors.
    pub steem_block: u64,

    /// Timestamp of the upstream block, ms since epoch.
    pub steem_ts: u64,

    pub txs: Vec<Transaction>,

    /// Account name of the producing witness.
    pub witness: String,

    /// Primary witness that failed this slot, when produced by a backup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missed_by: Option<String>,

    /// Total amount distributed by this block's transactions.
    pub dist: Amount,

    /// Whether the block was produced in sync mode.
    pub sync: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Block {
    /// Canonical JSON value: the block object without `hash` and
    /// `signature`.  Key order is handled by serde_json's map (see
    /// [`crate::hash::json`]).
    pub fn canonical_value(&self) -> Value {
        let mut v = serde_json::to_value(self).expect("block: serialize");
        if let Some(obj) = v.as_object_mut() {
            obj.remove("hash");
            obj.remove("signature");
        }
        v
    }

    /// SHA-256 of the canonical serialization.
    pub fn compute_hash(&self) -> Buf32 {
        hash::json(&self.canonical_value())
    }

    /// Computes the hash and signs it, filling in both fields.
    pub fn seal(&mut self, sk: &SecretKey) {
        let digest = self.compute_hash();
        self.hash = Some(digest.to_hex());
        self.signature = Some(crypto::sign_hash(&digest, sk));
    }

    /// Checks the `hash` field matches the canonical serialization.
    pub fn verify_hash(&self) -> bool {
        match &self.hash {
            Some(h) => *h == self.compute_hash().to_hex(),
            None => false,
        }
    }

    /// Verifies the signature against the stated hash and the given witness
    /// public key.
    pub fn verify_signature(&self, pub_b58: &str) -> Result<(), CryptoError> {
        let (Some(h), Some(sig)) = (&self.hash, &self.signature) else {
            return Err(CryptoError::InvalidSignature);
        };
        let digest: Buf32 = h.parse().map_err(|_| CryptoError::InvalidSignature)?;
        crypto::verify_hash_sig(&digest, sig, pub_b58)
    }
}

#[cfg(test)]
mod tests {
    use secp256k1::SecretKey;

    use super::*;
    use crate::crypto::{pubkey_for, pubkey_to_b58};

    fn sample_block() -> Block {
        Block {
            id: 1,
            phash: "00".repeat(32),
            timestamp: 1000,
            steem_block: 100,
            steem_ts: 900,
            txs: vec![],
            witness: "alice".to_owned(),
            missed_by: None,
            dist: Amount::new(0),
            sync: false,
            hash: None,
            signature: None,
        }
    }

    #[test]
    fn test_canonical_excludes_seal_fields() {
        let mut b = sample_block();
        let before = b.compute_hash();
        b.hash = Some("bogus".to_owned());
        b.signature = Some("bogus".to_owned());
        assert_eq!(b.compute_hash(), before);
    }

    #[test]
    fn test_hash_deterministic_across_clones() {
        let b = sample_block();
        let b2: Block = serde_json::from_value(serde_json::to_value(&b).unwrap()).unwrap();
        assert_eq!(b.compute_hash(), b2.compute_hash());
    }

    #[test]
    fn test_missed_by_affects_hash() {
        let mut b = sample_block();
        let h = b.compute_hash();
        b.missed_by = Some("bob".to_owned());
        assert_ne!(b.compute_hash(), h);
    }

    #[test]
    fn test_seal_and_verify() {
        let sk = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let pub_b58 = pubkey_to_b58(&pubkey_for(&sk));

        let mut b = sample_block();
        b.seal(&sk);
        assert!(b.verify_hash());
        b.verify_signature(&pub_b58).expect("test: signature");

        // Mutating a field invalidates the sealed hash.
        b.timestamp += 1;
        assert!(!b.verify_hash());
    }
}
