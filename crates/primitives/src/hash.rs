//! Common wrapper around whatever we choose our native hash function to be.

use digest::Digest;
use serde_json::Value;
use sha2::Sha256;

use crate::buf::Buf32;

/// Direct untagged hash.
pub fn raw(buf: &[u8]) -> Buf32 {
    Buf32::from(<[u8; 32]>::from(Sha256::digest(buf)))
}

/// Hashes the compact JSON serialization of a value.
///
/// serde_json's `Map` is a `BTreeMap`, so object keys come out sorted
/// ascending by code point; the `preserve_order` feature must stay off or
/// this stops being canonical.
pub fn json(value: &Value) -> Buf32 {
    raw(value.to_string().as_bytes())
}
