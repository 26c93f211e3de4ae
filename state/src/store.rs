//! Transactional state store
//!
//! All public operations take a single coarse lock per store instance, so no
//! two mutations interleave. Events are queued while the lock is held and
//! delivered after it is released, in the order the mutations were applied.

use enginelink_core::{
    BridgeError, BridgeResult, Event, EventBus, Metadata, PeriodicJob, Scheduler,
    StoreConfig, Timestamp, TransactionId, Value, Version,
};
use enginelink_crypto::{checksum, Checksum};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::snapshot::{Snapshot, SnapshotManager};
use crate::transaction::{StagedOp, TransactionInfo, TransactionStatus, TransactionTable};

/// A versioned store entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    /// Starts at 1, incremented by exactly 1 on every mutation
    pub version: Version,
    /// Checksum of `value`, recomputed on every write
    pub checksum: Checksum,
    pub metadata: Metadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl StateEntry {
    fn new(key: String, value: Value, metadata: Metadata) -> Self {
        let now = Timestamp::now();
        Self {
            checksum: checksum(&value),
            key,
            value,
            version: Version::initial(),
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the stored checksum against the current value
    pub fn verify(&self) -> bool {
        checksum(&self.value) == self.checksum
    }
}

/// Events emitted by the store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    EntryCreated { key: String, value: Value },
    EntryUpdated { key: String, previous: Value, value: Value },
    EntryDeleted { key: String },
    TransactionStarted(TransactionId),
    TransactionCommitted(TransactionId),
    TransactionRolledBack(TransactionId),
}

/// Discriminant of [`StoreEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEventKind {
    EntryCreated,
    EntryUpdated,
    EntryDeleted,
    TransactionStarted,
    TransactionCommitted,
    TransactionRolledBack,
}

impl Event for StoreEvent {
    type Kind = StoreEventKind;

    fn kind(&self) -> StoreEventKind {
        match self {
            StoreEvent::EntryCreated { .. } => StoreEventKind::EntryCreated,
            StoreEvent::EntryUpdated { .. } => StoreEventKind::EntryUpdated,
            StoreEvent::EntryDeleted { .. } => StoreEventKind::EntryDeleted,
            StoreEvent::TransactionStarted(_) => StoreEventKind::TransactionStarted,
            StoreEvent::TransactionCommitted(_) => StoreEventKind::TransactionCommitted,
            StoreEvent::TransactionRolledBack(_) => StoreEventKind::TransactionRolledBack,
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub entry_count: usize,
    pub snapshot_count: usize,
    pub active_transactions: usize,
}

struct StoreInner {
    entries: HashMap<String, StateEntry>,
    transactions: TransactionTable,
    snapshots: SnapshotManager,
}

/// In-memory, versioned key/value store with transactions and snapshots
pub struct StateStore {
    config: StoreConfig,
    inner: RwLock<StoreInner>,
    events: EventBus<StoreEvent>,
    scheduler: Scheduler,
}

impl StateStore {
    pub fn new(config: StoreConfig) -> Self {
        if config.enable_persistence {
            warn!("Store persistence requested but no persistence collaborator is attached");
        }

        Self {
            inner: RwLock::new(StoreInner {
                entries: HashMap::new(),
                transactions: TransactionTable::new(),
                snapshots: SnapshotManager::new(config.snapshot_capacity),
            }),
            config,
            events: EventBus::new(),
            scheduler: Scheduler::new("state-store"),
        }
    }

    /// Event registry for store observers
    pub fn events(&self) -> &EventBus<StoreEvent> {
        &self.events
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ============ Direct access ============

    /// Create or update an entry, returning its new version
    ///
    /// Metadata is merged into existing metadata rather than replacing it.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: Value,
        metadata: Option<Metadata>,
    ) -> BridgeResult<Version> {
        let version = {
            let mut inner = self.inner.write();
            self.apply_set(&mut inner, key.into(), value, metadata)?
        };
        self.events.flush();
        Ok(version)
    }

    /// Current value of `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().entries.get(key).map(|e| e.value.clone())
    }

    /// Full entry including version, checksum and metadata
    pub fn get_entry(&self, key: &str) -> Option<StateEntry> {
        self.inner.read().entries.get(key).cloned()
    }

    /// Remove an entry; returns false if it was absent
    pub fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            self.apply_delete(&mut inner, key)
        };
        self.events.flush();
        removed
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner
            .read()
            .entries
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    /// Copy of every current entry (not a live view)
    pub fn entries(&self) -> Vec<StateEntry> {
        self.inner.read().entries.values().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Remove every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let removed = {
            let mut inner = self.inner.write();
            let keys: Vec<String> = inner.entries.keys().cloned().collect();
            for key in &keys {
                self.apply_delete(&mut inner, key);
            }
            keys.len()
        };
        self.events.flush();

        info!("Store cleared ({} entries)", removed);
        removed
    }

    /// Recompute an entry's checksum; `None` if the key is absent
    pub fn verify_entry(&self, key: &str) -> Option<bool> {
        self.inner.read().entries.get(key).map(StateEntry::verify)
    }

    // ============ Transactions ============

    pub fn begin_transaction(&self) -> TransactionId {
        let id = {
            let mut inner = self.inner.write();
            let id = inner.transactions.begin(self.config.transaction_timeout());
            self.events.enqueue(StoreEvent::TransactionStarted(id));
            id
        };
        self.events.flush();

        debug!("Transaction {} started", id);
        id
    }

    /// Stage a `set` inside an active transaction
    pub fn transaction_set(
        &self,
        id: &TransactionId,
        key: impl Into<String>,
        value: Value,
    ) -> BridgeResult<()> {
        self.stage(
            id,
            StagedOp::Set {
                key: key.into(),
                value,
            },
        )
    }

    /// Stage a `delete` inside an active transaction
    pub fn transaction_delete(&self, id: &TransactionId, key: impl Into<String>) -> BridgeResult<()> {
        self.stage(id, StagedOp::Delete { key: key.into() })
    }

    /// Apply every staged operation in staging order
    ///
    /// Each operation behaves like an independent `set`/`delete` (own version
    /// bump, own event). If any staged `set` would exceed capacity nothing is
    /// applied, the transaction is rolled back and `CapacityExceeded` returned.
    pub fn commit_transaction(&self, id: &TransactionId) -> BridgeResult<()> {
        let result = {
            let mut inner = self.inner.write();
            self.commit_locked(&mut inner, id)
        };
        self.events.flush();
        result
    }

    /// Discard staged operations without touching live state
    pub fn rollback_transaction(&self, id: &TransactionId) -> BridgeResult<()> {
        let result = {
            let mut inner = self.inner.write();
            self.ensure_live(&mut inner, id)
                .and_then(|_| self.rollback_locked(&mut inner, id))
        };
        self.events.flush();

        if result.is_ok() {
            info!("Transaction {} rolled back", id);
        }
        result
    }

    pub fn get_transaction(&self, id: &TransactionId) -> Option<TransactionInfo> {
        self.inner.read().transactions.info(id)
    }

    /// Roll back every transaction past its deadline
    pub fn sweep_expired_transactions(&self) -> Vec<TransactionId> {
        let expired = {
            let mut inner = self.inner.write();
            let expired = inner.transactions.expired(Timestamp::now());
            for id in &expired {
                // Ids come from the table under the same lock
                let _ = self.rollback_locked(&mut inner, id);
            }
            expired
        };
        self.events.flush();

        for id in &expired {
            warn!("Transaction {} timed out and was rolled back", id);
        }
        expired
    }

    // ============ Snapshots ============

    /// Capture the current value of `key`; `None` if absent
    pub fn create_snapshot(&self, key: &str) -> Option<Snapshot> {
        let mut inner = self.inner.write();
        let entry = inner.entries.get(key)?;
        let snapshot = Snapshot::new(key, entry.version, entry.value.clone());

        let evicted = inner.snapshots.add(snapshot.clone());
        if evicted > 0 {
            debug!("Evicted {} snapshots (capacity {})", evicted, self.config.snapshot_capacity);
        }

        debug!("Snapshot of {} at {}", key, snapshot.version);
        Some(snapshot)
    }

    pub fn get_snapshot(&self, key: &str, version: Version) -> Option<Snapshot> {
        self.inner.read().snapshots.at_version(key, version).cloned()
    }

    pub fn latest_snapshot(&self, key: &str) -> Option<Snapshot> {
        self.inner.read().snapshots.latest(key).cloned()
    }

    pub fn list_snapshots(&self, key: &str) -> Vec<Snapshot> {
        self.inner.read().snapshots.for_key(key)
    }

    /// Write a snapshot's data back as the live value
    ///
    /// Counts as a normal write: the entry's version increments.
    pub fn restore_from_snapshot(&self, snapshot: &Snapshot) -> BridgeResult<Version> {
        let version = {
            let mut inner = self.inner.write();
            self.apply_set(
                &mut inner,
                snapshot.state_id.clone(),
                snapshot.data.clone(),
                None,
            )?
        };
        self.events.flush();

        info!(
            "Restored {} from snapshot {} (now {})",
            snapshot.state_id, snapshot.version, version
        );
        Ok(version)
    }

    pub fn get_stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            entry_count: inner.entries.len(),
            snapshot_count: inner.snapshots.len(),
            active_transactions: inner.transactions.active_count(),
        }
    }

    // ============ Lifecycle ============

    /// Start the expired-transaction sweep; idempotent
    pub fn start(self: &Arc<Self>) -> BridgeResult<()> {
        let weak: Weak<StateStore> = Arc::downgrade(self);
        let job = PeriodicJob::new(
            "transaction-sweep",
            self.config.transaction_sweep_interval(),
            move || match weak.upgrade() {
                Some(store) => {
                    store.sweep_expired_transactions();
                    true
                }
                None => false,
            },
        );

        if self.scheduler.start(vec![job])? {
            info!("State store background tasks started");
        }
        Ok(())
    }

    /// Cancel background tasks; idempotent
    pub fn stop(&self) {
        if self.scheduler.stop() > 0 {
            info!("State store background tasks stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    // ============ Internals (lock held) ============

    fn apply_set(
        &self,
        inner: &mut StoreInner,
        key: String,
        value: Value,
        metadata: Option<Metadata>,
    ) -> BridgeResult<Version> {
        if let Some(entry) = inner.entries.get_mut(&key) {
            let previous = std::mem::replace(&mut entry.value, value.clone());
            entry.version = entry.version.next();
            entry.checksum = checksum(&entry.value);
            entry.updated_at = Timestamp::now();
            if let Some(metadata) = metadata {
                entry.metadata.extend(metadata);
            }

            let version = entry.version;
            debug!("Updated {} to {}", key, version);
            self.events.enqueue(StoreEvent::EntryUpdated {
                key,
                previous,
                value,
            });
            return Ok(version);
        }

        if inner.entries.len() >= self.config.max_entries {
            return Err(BridgeError::CapacityExceeded {
                resource: "entries",
                limit: self.config.max_entries,
            });
        }

        let entry = StateEntry::new(key.clone(), value.clone(), metadata.unwrap_or_default());
        let version = entry.version;
        inner.entries.insert(key.clone(), entry);

        debug!("Created {}", key);
        self.events.enqueue(StoreEvent::EntryCreated { key, value });
        Ok(version)
    }

    fn apply_delete(&self, inner: &mut StoreInner, key: &str) -> bool {
        if inner.entries.remove(key).is_none() {
            return false;
        }
        debug!("Deleted {}", key);
        self.events.enqueue(StoreEvent::EntryDeleted {
            key: key.to_string(),
        });
        true
    }

    fn stage(&self, id: &TransactionId, op: StagedOp) -> BridgeResult<()> {
        let result = {
            let mut inner = self.inner.write();
            self.ensure_live(&mut inner, id).and_then(|_| {
                inner.transactions.active_mut(id)?.stage(op);
                Ok(())
            })
        };
        self.events.flush();
        result
    }

    /// Fail for unknown/terminated ids, auto-rolling back expired ones
    fn ensure_live(&self, inner: &mut StoreInner, id: &TransactionId) -> BridgeResult<()> {
        let expired = inner
            .transactions
            .active_mut(id)?
            .is_expired(Timestamp::now());

        if expired {
            self.rollback_locked(inner, id)?;
            warn!("Transaction {} timed out and was rolled back", id);
            return Err(BridgeError::invalid_transaction(*id, "timed out"));
        }
        Ok(())
    }

    fn rollback_locked(&self, inner: &mut StoreInner, id: &TransactionId) -> BridgeResult<()> {
        inner
            .transactions
            .finish(id, TransactionStatus::RolledBack)?;
        self.events.enqueue(StoreEvent::TransactionRolledBack(*id));
        Ok(())
    }

    fn commit_locked(&self, inner: &mut StoreInner, id: &TransactionId) -> BridgeResult<()> {
        self.ensure_live(inner, id)?;

        let ops = inner.transactions.active_mut(id)?.ops.clone();

        if let Err(e) = self.check_capacity(inner, &ops) {
            self.rollback_locked(inner, id)?;
            warn!("Transaction {} rejected: {}", id, e);
            return Err(e);
        }

        let txn = inner.transactions.finish(id, TransactionStatus::Committed)?;
        for op in txn.ops {
            match op {
                StagedOp::Set { key, value } => {
                    self.apply_set(inner, key, value, None)?;
                }
                StagedOp::Delete { key } => {
                    self.apply_delete(inner, &key);
                }
            }
        }
        self.events.enqueue(StoreEvent::TransactionCommitted(*id));

        info!("Transaction {} committed ({} ops)", id, ops.len());
        Ok(())
    }

    /// Replay staged ops against key presence only, so a commit either
    /// applies completely or not at all
    fn check_capacity(&self, inner: &StoreInner, ops: &[StagedOp]) -> BridgeResult<()> {
        let mut present: HashSet<&str> = HashSet::new();
        let mut absent: HashSet<&str> = HashSet::new();
        let mut count = inner.entries.len();

        for op in ops {
            let key = op.key();
            let exists = present.contains(key)
                || (!absent.contains(key) && inner.entries.contains_key(key));

            match op {
                StagedOp::Set { .. } if !exists => {
                    if count >= self.config.max_entries {
                        return Err(BridgeError::CapacityExceeded {
                            resource: "entries",
                            limit: self.config.max_entries,
                        });
                    }
                    count += 1;
                    absent.remove(key);
                    present.insert(key);
                }
                StagedOp::Delete { .. } if exists => {
                    count -= 1;
                    present.remove(key);
                    absent.insert(key);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Thread-safe store wrapper
pub type SharedStateStore = Arc<StateStore>;

/// Create a shared state store
pub fn create_state_store(config: StoreConfig) -> SharedStateStore {
    Arc::new(StateStore::new(config))
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
