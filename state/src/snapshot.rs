//! Point-in-time entry snapshots

use enginelink_core::{BridgeResult, Timestamp, Value, Version};
use enginelink_crypto::{checksum, Checksum};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// An immutable copy of one entry's value at a specific version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Key of the captured entry
    pub state_id: String,
    /// Entry version at capture time
    pub version: Version,
    /// Deep copy of the value at that version
    pub data: Value,
    /// Checksum of `data`
    pub checksum: Checksum,
    /// Capture time
    pub captured_at: Timestamp,
}

impl Snapshot {
    pub fn new(state_id: impl Into<String>, version: Version, data: Value) -> Self {
        let checksum = checksum(&data);
        Self {
            state_id: state_id.into(),
            version,
            data,
            checksum,
            captured_at: Timestamp::now(),
        }
    }

    /// Verify snapshot integrity
    pub fn verify(&self) -> bool {
        checksum(&self.data) == self.checksum
    }

    /// Serialize snapshot to JSON bytes
    pub fn to_bytes(&self) -> BridgeResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize snapshot from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Bounded snapshot retention
///
/// Capacity is global across keys; when exceeded the oldest capture is
/// evicted first, whichever key it belongs to.
#[derive(Debug)]
pub struct SnapshotManager {
    snapshots: VecDeque<Snapshot>,
    capacity: usize,
}

impl SnapshotManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            capacity,
        }
    }

    /// Add a snapshot, returning how many old snapshots were evicted
    pub fn add(&mut self, snapshot: Snapshot) -> usize {
        self.snapshots.push_back(snapshot);

        let mut evicted = 0;
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Most recent snapshot of `key` at `version`
    pub fn at_version(&self, key: &str, version: Version) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .rev()
            .find(|s| s.state_id == key && s.version == version)
    }

    /// Most recent snapshot of `key`
    pub fn latest(&self, key: &str) -> Option<&Snapshot> {
        self.snapshots.iter().rev().find(|s| s.state_id == key)
    }

    /// All retained snapshots of `key`, oldest first
    pub fn for_key(&self, key: &str) -> Vec<Snapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.state_id == key)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = Snapshot::new("arena", Version::new(3), json!({"round": 2}));
        assert!(snapshot.verify());

        let bytes = snapshot.to_bytes().unwrap();
        let restored = Snapshot::from_bytes(&bytes).unwrap();

        assert_eq!(restored, snapshot);
        assert!(restored.verify());
    }

    #[test]
    fn test_tampered_snapshot_fails_verification() {
        let mut snapshot = Snapshot::new("arena", Version::new(1), json!({"round": 1}));
        snapshot.data = json!({"round": 9});
        assert!(!snapshot.verify());
    }

    #[test]
    fn test_global_fifo_eviction() {
        let mut manager = SnapshotManager::new(3);

        manager.add(Snapshot::new("a", Version::new(1), json!(1)));
        manager.add(Snapshot::new("b", Version::new(1), json!(1)));
        manager.add(Snapshot::new("a", Version::new(2), json!(2)));
        let evicted = manager.add(Snapshot::new("c", Version::new(1), json!(1)));

        // Should only keep last 3; the first capture of "a" goes
        assert_eq!(evicted, 1);
        assert_eq!(manager.len(), 3);
        assert!(manager.at_version("a", Version::new(1)).is_none());
        assert_eq!(manager.latest("a").unwrap().version, Version::new(2));
        assert_eq!(manager.for_key("b").len(), 1);
    }
}
