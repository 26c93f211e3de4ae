//! Core types for EngineLink
//!
//! Defines the document value model, versions, timestamps and identifiers
//! shared by the store and the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Dynamically-typed document value (null, bool, number, string, array, map)
pub type Value = serde_json::Value;

/// Open string-keyed metadata attached to store entries
pub type Metadata = serde_json::Map<String, Value>;

/// Session identifier assigned by the transport layer
pub type SessionId = String;

/// Name of a sync state
pub type StateId = String;

/// Per-key / per-state version for optimistic concurrency
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// Version assigned on creation
    pub const INITIAL: Version = Version(1);

    pub fn new(value: u64) -> Self {
        Version(value)
    }

    pub fn initial() -> Self {
        Self::INITIAL
    }

    pub fn next(&self) -> Version {
        Version(self.0 + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

/// Timestamp in milliseconds since Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Timestamp shifted forward by `millis`
    pub fn plus_millis(&self, millis: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(millis))
    }

    /// Milliseconds elapsed between `self` and `later` (zero if `later` is earlier)
    pub fn elapsed_until(&self, later: Timestamp) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Opaque, single-use transaction identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("txn:").unwrap_or(s);
        Ok(TransactionId(Uuid::parse_str(raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_sequence() {
        let v = Version::initial();
        assert_eq!(v, Version::new(1));
        assert_eq!(v.next(), Version::new(2));
        assert_eq!(v.next().to_string(), "v2");
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!(t.plus_millis(500).as_millis(), 1_500);
        assert_eq!(t.elapsed_until(Timestamp::from_millis(1_250)), 250);
        assert_eq!(t.elapsed_until(Timestamp::from_millis(10)), 0);
    }

    #[test]
    fn test_transaction_id_parse() {
        let id = TransactionId::generate();
        let parsed: TransactionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_ne!(id, TransactionId::generate());
    }
}
