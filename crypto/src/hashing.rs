//! Content hashing using BLAKE3

use enginelink_core::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte content checksum
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    pub const ZERO: Checksum = Checksum([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Checksum(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Checksum(arr))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

/// Compute BLAKE3 hash of raw bytes
pub fn hash(data: &[u8]) -> Checksum {
    Checksum::from_bytes(*blake3::hash(data).as_bytes())
}

/// Checksum of a document value
///
/// Object keys serialize in sorted order, so structurally equal documents
/// always produce the same checksum.
pub fn checksum(value: &Value) -> Checksum {
    let mut hasher = blake3::Hasher::new();
    // Writing into a hasher cannot fail for serde_json::Value
    if serde_json::to_writer(&mut hasher, value).is_err() {
        return Checksum::ZERO;
    }
    Checksum::from_bytes(*hasher.finalize().as_bytes())
}

/// Recompute and compare a stored checksum
pub fn verify(value: &Value, expected: &Checksum) -> bool {
    checksum(value) == *expected
}
