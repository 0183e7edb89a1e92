//! Canonical serialisation helpers shared by the blob codecs.
//!
//! Content-addressing requires that two logically-equal items encode to
//! byte-identical blobs, so every stored document goes through these helpers
//! rather than ad-hoc `serde_json` calls: JSON is emitted compact with keys
//! sorted (the default `serde_json` map is ordered), and path-fanout hashes
//! are always SHA-256 regardless of the repository object format.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::StrataError;

/// data (any serialisable type) -> canonical JSON bytes.
pub fn json_pack<T: Serialize>(data: &T) -> Result<Vec<u8>, StrataError> {
    Ok(serde_json::to_vec(data)?)
}

/// canonical JSON bytes -> JSON value.
pub fn json_unpack(bytes: &[u8]) -> Result<Value, StrataError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// data -> SHA-256 digest. Irreversible.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// data -> hex str. Irreversible.
///
/// Only 160 bits of the hash are returned, same as git SHA-1 hashes - more
/// is overkill for fanout directories and legend identifiers.
pub fn hexhash(data: &[u8]) -> String {
    hex::encode(sha256(data))[..40].to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Maps serialise with sorted keys no matter the insertion order.
    #[test]
    fn test_json_pack_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(json_pack(&a).unwrap(), json_pack(&b).unwrap());
        assert_eq!(json_pack(&a).unwrap(), br#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_json_roundtrip() {
        let v = json!([1, "two", null, {"three": 3.5}]);
        let bytes = json_pack(&v).unwrap();
        assert_eq!(json_unpack(&bytes).unwrap(), v);
    }

    /// hexhash is the first 40 hex chars of SHA-256.
    #[test]
    fn test_hexhash() {
        assert_eq!(hexhash(b"abc"), "ba7816bf8f01cfea414140de5dae2223b00361a3");
        assert_eq!(hexhash(b"abc").len(), 40);
    }
}
