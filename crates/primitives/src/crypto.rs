//! Witness key handling: secp256k1 compact ECDSA over block hashes, with
//! base58 text encodings for keys and signatures.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use crate::buf::Buf32;
use crate::errors::CryptoError;

/// Signs a 32-byte digest, returning the base58 of the 64-byte compact sig.
pub fn sign_hash(hash: &Buf32, sk: &SecretKey) -> String {
    let msg = Message::from_digest(hash.0);
    let sig = SECP256K1.sign_ecdsa(&msg, sk);
    bs58::encode(sig.serialize_compact()).into_string()
}

/// Verifies a base58 compact signature over a digest against a base58
/// compressed public key.
pub fn verify_hash_sig(hash: &Buf32, sig_b58: &str, pub_b58: &str) -> Result<(), CryptoError> {
    let sig_raw = bs58::decode(sig_b58).into_vec()?;
    let sig = Signature::from_compact(&sig_raw).map_err(|_| CryptoError::InvalidSignature)?;
    let pk = pubkey_from_b58(pub_b58)?;
    let msg = Message::from_digest(hash.0);
    SECP256K1
        .verify_ecdsa(&msg, &sig, &pk)
        .map_err(|_| CryptoError::InvalidSignature)
}

pub fn seckey_from_b58(s: &str) -> Result<SecretKey, CryptoError> {
    let raw = bs58::decode(s).into_vec()?;
    SecretKey::from_slice(&raw).map_err(|_| CryptoError::InvalidSecretKey)
}

pub fn pubkey_from_b58(s: &str) -> Result<PublicKey, CryptoError> {
    let raw = bs58::decode(s).into_vec()?;
    PublicKey::from_slice(&raw).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Base58 of the 33-byte compressed public key.
pub fn pubkey_to_b58(pk: &PublicKey) -> String {
    bs58::encode(pk.serialize()).into_string()
}

pub fn pubkey_for(sk: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(SECP256K1, sk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    fn test_key() -> SecretKey {
        SecretKey::from_slice(&[0x42; 32]).expect("test: seckey")
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let sk = test_key();
        let pk_b58 = pubkey_to_b58(&pubkey_for(&sk));
        let digest = hash::raw(b"some block hash");

        let sig = sign_hash(&digest, &sk);
        verify_hash_sig(&digest, &sig, &pk_b58).expect("test: verify");

        // A different digest must not verify.
        let other = hash::raw(b"tampered");
        assert!(verify_hash_sig(&other, &sig, &pk_b58).is_err());
    }

    #[test]
    fn test_key_b58_roundtrip() {
        let sk = test_key();
        let b58 = bs58::encode(sk.secret_bytes()).into_string();
        let back = seckey_from_b58(&b58).expect("test: decode");
        assert_eq!(back, sk);
    }
}
