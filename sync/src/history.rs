//! Per-state delta history and snapshot retention

use enginelink_core::{Timestamp, Value, Version};
use enginelink_crypto::{checksum, Checksum};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::patch::Operation;

/// Operations that advanced a state from `version - 1` to `version`
#[derive(Debug, Clone, PartialEq)]
struct DeltaRecord {
    version: Version,
    ops: Vec<Operation>,
}

/// Bounded log of recent deltas for one state
#[derive(Debug, Clone)]
pub struct DeltaHistory {
    records: VecDeque<DeltaRecord>,
    limit: usize,
}

impl DeltaHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            limit,
        }
    }

    /// Record the operations producing `version`
    ///
    /// Versions must be recorded consecutively; a gap discards older records
    /// since they can no longer be chained.
    pub fn record(&mut self, version: Version, ops: Vec<Operation>) {
        if let Some(last) = self.records.back() {
            if last.version.next() != version {
                self.records.clear();
            }
        }

        self.records.push_back(DeltaRecord { version, ops });
        while self.records.len() > self.limit {
            self.records.pop_front();
        }
    }

    /// Concatenated operations advancing `base` to `current`
    ///
    /// `None` when the required range is no longer retained.
    pub fn since(&self, base: Version, current: Version) -> Option<Vec<Operation>> {
        if base == current {
            return Some(Vec::new());
        }
        if base > current {
            return None;
        }

        let first = self.records.front()?;
        let last = self.records.back()?;
        if first.version > base.next() || last.version != current {
            return None;
        }

        Some(
            self.records
                .iter()
                .filter(|r| r.version > base)
                .flat_map(|r| r.ops.iter().cloned())
                .collect(),
        )
    }

    /// Oldest version a delta can still be built from
    pub fn oldest_base(&self) -> Option<Version> {
        self.records.front().map(|r| Version::new(r.version.as_u64().saturating_sub(1)))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Copy of a sync state's data at one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state_id: String,
    pub version: Version,
    pub data: Value,
    pub checksum: Checksum,
    pub captured_at: Timestamp,
}

impl StateSnapshot {
    pub fn new(state_id: impl Into<String>, version: Version, data: Value) -> Self {
        Self {
            state_id: state_id.into(),
            version,
            checksum: checksum(&data),
            data,
            captured_at: Timestamp::now(),
        }
    }

    pub fn verify(&self) -> bool {
        checksum(&self.data) == self.checksum
    }

    pub fn age_millis(&self, now: Timestamp) -> u64 {
        self.captured_at.elapsed_until(now)
    }
}

/// Snapshots of one state, oldest first, capped in count
#[derive(Debug, Clone)]
pub struct SnapshotRing {
    snapshots: VecDeque<StateSnapshot>,
    capacity: usize,
}

impl SnapshotRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            capacity,
        }
    }

    /// Add a snapshot, returning how many were evicted to make room
    pub fn push(&mut self, snapshot: StateSnapshot) -> usize {
        self.snapshots.push_back(snapshot);

        let mut evicted = 0;
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Drop snapshots older than `ttl_millis`, returning how many were removed
    pub fn evict_older_than(&mut self, ttl_millis: u64, now: Timestamp) -> usize {
        let before = self.snapshots.len();
        self.snapshots.retain(|s| s.age_millis(now) < ttl_millis);
        before - self.snapshots.len()
    }

    pub fn at_version(&self, version: Version) -> Option<&StateSnapshot> {
        self.snapshots.iter().rev().find(|s| s.version == version)
    }

    pub fn latest(&self) -> Option<&StateSnapshot> {
        self.snapshots.back()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(n: i64) -> Operation {
        Operation::replace("/n", json!(n))
    }

    #[test]
    fn test_history_chains_consecutive_versions() {
        let mut history = DeltaHistory::new(8);
        for v in 2..=5 {
            history.record(Version::new(v), vec![op(v as i64)]);
        }

        assert_eq!(history.since(Version::new(1), Version::new(5)).unwrap().len(), 4);
        assert_eq!(
            history.since(Version::new(3), Version::new(5)).unwrap(),
            vec![op(4), op(5)]
        );
        assert!(history.since(Version::new(5), Version::new(5)).unwrap().is_empty());
        assert!(history.since(Version::new(6), Version::new(5)).is_none());
    }

    #[test]
    fn test_history_limit_drops_old_baselines() {
        let mut history = DeltaHistory::new(2);
        for v in 2..=5 {
            history.record(Version::new(v), vec![op(v as i64)]);
        }

        assert_eq!(history.len(), 2);
        assert_eq!(history.oldest_base(), Some(Version::new(3)));
        assert!(history.since(Version::new(2), Version::new(5)).is_none());
        assert!(history.since(Version::new(3), Version::new(5)).is_some());
    }

    #[test]
    fn test_history_gap_resets() {
        let mut history = DeltaHistory::new(8);
        history.record(Version::new(2), vec![op(2)]);
        history.record(Version::new(4), vec![op(4)]);

        assert_eq!(history.len(), 1);
        assert!(history.since(Version::new(1), Version::new(4)).is_none());
    }

    #[test]
    fn test_snapshot_ring_capacity_and_ttl() {
        let mut ring = SnapshotRing::new(2);
        ring.push(StateSnapshot::new("s", Version::new(1), json!(1)));
        ring.push(StateSnapshot::new("s", Version::new(2), json!(2)));
        let evicted = ring.push(StateSnapshot::new("s", Version::new(3), json!(3)));

        assert_eq!(evicted, 1);
        assert!(ring.at_version(Version::new(1)).is_none());
        assert_eq!(ring.latest().unwrap().version, Version::new(3));

        let later = ring.latest().unwrap().captured_at.plus_millis(1_000);
        assert_eq!(ring.evict_older_than(500, later), 2);
        assert!(ring.is_empty());
    }
}
