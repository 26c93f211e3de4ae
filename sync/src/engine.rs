//! Synchronization engine
//!
//! Keeps independently versioned shared documents with their subscriber sets.
//! Writes use optimistic concurrency: a stale expected version is rejected,
//! never merged. A single coarse lock guards all states; events are queued
//! under the lock and delivered after it is released.

use enginelink_core::{
    BridgeError, BridgeResult, Event, EventBus, NotFoundKind, PeriodicJob, Scheduler, SessionId,
    StateId, SyncConfig, Timestamp, Value, Version,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::history::{DeltaHistory, SnapshotRing, StateSnapshot};
use crate::patch::{apply_operations, diff, Operation};
use crate::payload::{OperationsPayload, SyncPayload};

/// A shared document and its subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub state_id: StateId,
    /// Distinguishes a re-created state from an earlier one with the same id
    #[serde(default)]
    pub generation: u64,
    pub version: Version,
    pub data: Value,
    pub subscribers: BTreeSet<SessionId>,
    pub last_snapshot_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

/// Position of a receiver in one incarnation of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncCursor {
    pub generation: u64,
    pub version: Version,
}

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateCreated {
        state_id: StateId,
        version: Version,
    },
    StateUpdated {
        state_id: StateId,
        version: Version,
        data: Value,
    },
    /// Carries the sessions that were subscribed at deletion time
    StateDeleted {
        state_id: StateId,
        subscribers: Vec<SessionId>,
    },
    ConflictDetected {
        state_id: StateId,
        expected: Version,
        actual: Version,
    },
    SnapshotCaptured {
        state_id: StateId,
        version: Version,
    },
}

impl SyncEvent {
    pub fn state_id(&self) -> &str {
        match self {
            SyncEvent::StateCreated { state_id, .. }
            | SyncEvent::StateUpdated { state_id, .. }
            | SyncEvent::StateDeleted { state_id, .. }
            | SyncEvent::ConflictDetected { state_id, .. }
            | SyncEvent::SnapshotCaptured { state_id, .. } => state_id,
        }
    }
}

/// Discriminant of [`SyncEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventKind {
    StateCreated,
    StateUpdated,
    StateDeleted,
    ConflictDetected,
    SnapshotCaptured,
}

impl Event for SyncEvent {
    type Kind = SyncEventKind;

    fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::StateCreated { .. } => SyncEventKind::StateCreated,
            SyncEvent::StateUpdated { .. } => SyncEventKind::StateUpdated,
            SyncEvent::StateDeleted { .. } => SyncEventKind::StateDeleted,
            SyncEvent::ConflictDetected { .. } => SyncEventKind::ConflictDetected,
            SyncEvent::SnapshotCaptured { .. } => SyncEventKind::SnapshotCaptured,
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub state_count: usize,
    /// Sum of subscriber counts over all states
    pub subscription_count: usize,
    pub snapshot_count: usize,
}

struct StateRecord {
    state: SyncState,
    history: DeltaHistory,
    snapshots: SnapshotRing,
    /// Version of the last payload built by `create_sync_payload`
    last_sent: Option<Version>,
    last_snapshot_version: Option<Version>,
}

impl StateRecord {
    fn new(state_id: StateId, generation: u64, data: Value, config: &SyncConfig) -> Self {
        Self {
            state: SyncState {
                state_id,
                generation,
                version: Version::initial(),
                data,
                subscribers: BTreeSet::new(),
                last_snapshot_at: None,
                updated_at: Timestamp::now(),
            },
            history: DeltaHistory::new(config.delta_history_limit),
            snapshots: SnapshotRing::new(config.max_snapshots_per_state),
            last_sent: None,
            last_snapshot_version: None,
        }
    }
}

struct EngineInner {
    states: HashMap<StateId, StateRecord>,
    /// Reverse subscription index: session -> states
    sessions: HashMap<SessionId, HashSet<StateId>>,
    /// Last generation handed out by `create_state`
    generation: u64,
}

/// Versioned shared documents with subscriptions and delta payloads
pub struct SyncEngine {
    config: SyncConfig,
    inner: RwLock<EngineInner>,
    events: EventBus<SyncEvent>,
    scheduler: Scheduler,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(EngineInner {
                states: HashMap::new(),
                sessions: HashMap::new(),
                generation: 0,
            }),
            events: EventBus::new(),
            scheduler: Scheduler::new("sync-engine"),
        }
    }

    /// Event registry for engine observers
    pub fn events(&self) -> &EventBus<SyncEvent> {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ============ States ============

    /// Create a state at version 1
    pub fn create_state(&self, state_id: impl Into<StateId>, data: Value) -> BridgeResult<Version> {
        let state_id = state_id.into();
        let result = {
            let mut inner = self.inner.write();
            self.create_locked(&mut inner, state_id, data)
        };
        self.events.flush();
        result
    }

    pub fn get_state(&self, state_id: &str) -> Option<SyncState> {
        self.inner
            .read()
            .states
            .get(state_id)
            .map(|r| r.state.clone())
    }

    /// Replace a state's data, optionally guarded by the expected current version
    pub fn update_state(
        &self,
        state_id: &str,
        data: Value,
        expected_version: Option<Version>,
    ) -> BridgeResult<Version> {
        let result = {
            let mut inner = self.inner.write();
            self.update_locked(&mut inner, state_id, data, expected_version)
        };
        self.events.flush();
        result
    }

    /// Apply patch operations to a working copy and swap it in on success
    ///
    /// `payload.version` must equal the current version. Any failing operation
    /// rejects the whole batch and leaves the state untouched.
    pub fn apply_operations(
        &self,
        state_id: &str,
        payload: &OperationsPayload,
    ) -> BridgeResult<Version> {
        if payload.state_id != state_id {
            return Err(BridgeError::InvalidOperation(format!(
                "payload for {} applied to {}",
                payload.state_id, state_id
            )));
        }

        let result = {
            let mut inner = self.inner.write();
            self.patch_locked(&mut inner, state_id, payload)
        };
        self.events.flush();
        result
    }

    /// Remove a state and every subscription to it
    pub fn delete_state(&self, state_id: &str) -> bool {
        let removed = {
            let mut guard = self.inner.write();
            let inner = &mut *guard;

            match inner.states.remove(state_id) {
                Some(record) => {
                    for session in &record.state.subscribers {
                        detach_session(&mut inner.sessions, session, state_id);
                    }
                    self.events.enqueue(SyncEvent::StateDeleted {
                        state_id: state_id.to_string(),
                        subscribers: record.state.subscribers.into_iter().collect(),
                    });
                    true
                }
                None => false,
            }
        };

        if removed {
            info!("Deleted sync state {}", state_id);
            self.events.flush();
        }
        removed
    }

    pub fn get_state_count(&self) -> usize {
        self.inner.read().states.len()
    }

    /// All state ids, sorted
    pub fn get_all_state_ids(&self) -> Vec<StateId> {
        let mut ids: Vec<StateId> = self.inner.read().states.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ============ Subscriptions ============

    /// Subscribe a session; false if the state does not exist
    pub fn subscribe(&self, state_id: &str, session_id: &str) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let Some(record) = inner.states.get_mut(state_id) else {
            return false;
        };

        if record.state.subscribers.insert(session_id.to_string()) {
            inner
                .sessions
                .entry(session_id.to_string())
                .or_default()
                .insert(state_id.to_string());
            debug!("Session {} subscribed to {}", session_id, state_id);
        }
        true
    }

    /// Unsubscribe a session; false if it was not subscribed
    pub fn unsubscribe(&self, state_id: &str, session_id: &str) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let Some(record) = inner.states.get_mut(state_id) else {
            return false;
        };
        if !record.state.subscribers.remove(session_id) {
            return false;
        }

        detach_session(&mut inner.sessions, session_id, state_id);
        debug!("Session {} unsubscribed from {}", session_id, state_id);
        true
    }

    /// Drop every subscription of a session, returning how many were removed
    pub fn unsubscribe_all(&self, session_id: &str) -> usize {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let Some(state_ids) = inner.sessions.remove(session_id) else {
            return 0;
        };

        let mut removed = 0;
        for state_id in &state_ids {
            if let Some(record) = inner.states.get_mut(state_id) {
                if record.state.subscribers.remove(session_id) {
                    removed += 1;
                }
            }
        }

        debug!("Session {} left {} states", session_id, removed);
        removed
    }

    /// Current subscribers of a state, sorted; empty if the state is absent
    pub fn get_subscribers(&self, state_id: &str) -> Vec<SessionId> {
        self.inner
            .read()
            .states
            .get(state_id)
            .map(|r| r.state.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ============ Payloads ============

    /// Build a payload relative to the last payload built for this state
    ///
    /// The first payload, or any requested with `full_state`, carries the
    /// complete document.
    pub fn create_sync_payload(&self, state_id: &str, full_state: bool) -> Option<SyncPayload> {
        let mut inner = self.inner.write();
        let record = inner.states.get_mut(state_id)?;

        let payload = match record.last_sent {
            Some(base) if !full_state => self.payload_since(record, base),
            _ => full_payload(&record.state),
        };
        record.last_sent = Some(record.state.version);
        Some(payload)
    }

    /// Build a payload advancing a receiver from `base_version`
    ///
    /// Uses retained delta history, then a diff against a retained snapshot of
    /// `base_version`, and falls back to the full document.
    pub fn create_sync_payload_since(
        &self,
        state_id: &str,
        base_version: Version,
    ) -> Option<SyncPayload> {
        let inner = self.inner.read();
        let record = inner.states.get(state_id)?;
        Some(self.payload_since(record, base_version))
    }

    /// Build a payload advancing a receiver from `cursor`, and the cursor
    /// the receiver holds once it applies it
    ///
    /// A cursor from another incarnation of the state, or none at all, gets
    /// the full document.
    pub fn create_sync_payload_from(
        &self,
        state_id: &str,
        cursor: Option<SyncCursor>,
    ) -> Option<(SyncPayload, SyncCursor)> {
        let inner = self.inner.read();
        let record = inner.states.get(state_id)?;
        let state = &record.state;

        let payload = match cursor {
            Some(cursor) if cursor.generation == state.generation => {
                self.payload_since(record, cursor.version)
            }
            _ => full_payload(state),
        };
        let next = SyncCursor {
            generation: state.generation,
            version: state.version,
        };
        Some((payload, next))
    }

    // ============ Snapshots ============

    /// Capture the current data of a state
    pub fn capture_snapshot(&self, state_id: &str) -> Option<StateSnapshot> {
        let snapshot = {
            let mut inner = self.inner.write();
            let record = inner.states.get_mut(state_id)?;
            self.capture_locked(record)
        };
        self.events.flush();
        Some(snapshot)
    }

    pub fn get_snapshot(&self, state_id: &str, version: Version) -> Option<StateSnapshot> {
        self.inner
            .read()
            .states
            .get(state_id)
            .and_then(|r| r.snapshots.at_version(version).cloned())
    }

    pub fn latest_snapshot(&self, state_id: &str) -> Option<StateSnapshot> {
        self.inner
            .read()
            .states
            .get(state_id)
            .and_then(|r| r.snapshots.latest().cloned())
    }

    /// Total retained snapshots across all states
    pub fn snapshot_count(&self) -> usize {
        self.inner
            .read()
            .states
            .values()
            .map(|r| r.snapshots.len())
            .sum()
    }

    /// Evict expired snapshots and capture states that changed since their
    /// last snapshot and are due; returns the number captured
    pub fn run_snapshot_sweep(&self) -> usize {
        let now = Timestamp::now();
        let mut captured = 0;
        let mut evicted = 0;

        {
            let mut inner = self.inner.write();
            for record in inner.states.values_mut() {
                evicted += record
                    .snapshots
                    .evict_older_than(self.config.snapshot_ttl_ms, now);

                let changed = record.last_snapshot_version != Some(record.state.version);
                let due = record
                    .state
                    .last_snapshot_at
                    .map_or(true, |at| at.elapsed_until(now) >= self.config.snapshot_interval_ms);

                if changed && due {
                    self.capture_locked(record);
                    captured += 1;
                }
            }
        }
        self.events.flush();

        if captured > 0 || evicted > 0 {
            debug!(
                "Snapshot sweep: {} captured, {} expired",
                captured, evicted
            );
        }
        captured
    }

    pub fn get_stats(&self) -> SyncStats {
        let inner = self.inner.read();
        SyncStats {
            state_count: inner.states.len(),
            subscription_count: inner.states.values().map(|r| r.state.subscribers.len()).sum(),
            snapshot_count: inner.states.values().map(|r| r.snapshots.len()).sum(),
        }
    }

    // ============ Lifecycle ============

    /// Start the snapshot sweep; idempotent
    pub fn start(self: &Arc<Self>) -> BridgeResult<()> {
        let period = self.config.snapshot_interval().min(self.config.snapshot_ttl());
        let weak: Weak<SyncEngine> = Arc::downgrade(self);
        let job = PeriodicJob::new("snapshot-sweep", period, move || match weak.upgrade() {
            Some(engine) => {
                engine.run_snapshot_sweep();
                true
            }
            None => false,
        });

        if self.scheduler.start(vec![job])? {
            info!("Sync engine background tasks started");
        }
        Ok(())
    }

    /// Cancel background tasks; idempotent
    pub fn stop(&self) {
        if self.scheduler.stop() > 0 {
            info!("Sync engine background tasks stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    // ============ Internals (lock held) ============

    fn create_locked(
        &self,
        inner: &mut EngineInner,
        state_id: StateId,
        data: Value,
    ) -> BridgeResult<Version> {
        if inner.states.contains_key(&state_id) {
            return Err(BridgeError::DuplicateState(state_id));
        }
        if inner.states.len() >= self.config.max_states {
            return Err(BridgeError::CapacityExceeded {
                resource: "states",
                limit: self.config.max_states,
            });
        }

        inner.generation += 1;
        let record = StateRecord::new(state_id.clone(), inner.generation, data, &self.config);
        let version = record.state.version;
        inner.states.insert(state_id.clone(), record);

        info!("Created sync state {}", state_id);
        self.events
            .enqueue(SyncEvent::StateCreated { state_id, version });
        Ok(version)
    }

    fn update_locked(
        &self,
        inner: &mut EngineInner,
        state_id: &str,
        data: Value,
        expected_version: Option<Version>,
    ) -> BridgeResult<Version> {
        let record = record_mut(inner, state_id)?;
        if let Some(expected) = expected_version {
            self.check_version(record, expected)?;
        }

        let ops = if self.config.enable_delta_compression {
            diff(&record.state.data, &data)
        } else {
            Vec::new()
        };
        Ok(self.commit_change(record, data, ops))
    }

    fn patch_locked(
        &self,
        inner: &mut EngineInner,
        state_id: &str,
        payload: &OperationsPayload,
    ) -> BridgeResult<Version> {
        let record = record_mut(inner, state_id)?;
        self.check_version(record, payload.version)?;

        let mut working = record.state.data.clone();
        if let Err(e) = apply_operations(&mut working, &payload.operations) {
            debug!("Rejected operations on {}: {}", state_id, e);
            return Err(e);
        }

        Ok(self.commit_change(record, working, payload.operations.clone()))
    }

    /// Reject a stale expected version, emitting a conflict event
    fn check_version(&self, record: &StateRecord, expected: Version) -> BridgeResult<()> {
        let actual = record.state.version;
        if expected == actual {
            return Ok(());
        }

        let state_id = record.state.state_id.clone();
        warn!(
            "Version conflict on {}: expected {}, actual {}",
            state_id, expected, actual
        );
        self.events.enqueue(SyncEvent::ConflictDetected {
            state_id: state_id.clone(),
            expected,
            actual,
        });
        Err(BridgeError::VersionConflict {
            state_id,
            expected,
            actual,
        })
    }

    fn commit_change(&self, record: &mut StateRecord, data: Value, ops: Vec<Operation>) -> Version {
        let version = record.state.version.next();
        record.state.version = version;
        record.state.data = data;
        record.state.updated_at = Timestamp::now();

        if self.config.enable_delta_compression {
            record.history.record(version, ops);
        }

        debug!("Updated {} to {}", record.state.state_id, version);
        self.events.enqueue(SyncEvent::StateUpdated {
            state_id: record.state.state_id.clone(),
            version,
            data: record.state.data.clone(),
        });
        version
    }

    fn capture_locked(&self, record: &mut StateRecord) -> StateSnapshot {
        let state = &record.state;
        let snapshot = StateSnapshot::new(state.state_id.clone(), state.version, state.data.clone());

        record.snapshots.push(snapshot.clone());
        record.state.last_snapshot_at = Some(snapshot.captured_at);
        record.last_snapshot_version = Some(snapshot.version);

        self.events.enqueue(SyncEvent::SnapshotCaptured {
            state_id: snapshot.state_id.clone(),
            version: snapshot.version,
        });
        snapshot
    }

    fn payload_since(&self, record: &StateRecord, base: Version) -> SyncPayload {
        let state = &record.state;
        if !self.config.enable_delta_compression || base > state.version {
            return full_payload(state);
        }

        if let Some(ops) = record.history.since(base, state.version) {
            return SyncPayload::delta(state.state_id.clone(), base, state.version, ops);
        }

        if let Some(snapshot) = record.snapshots.at_version(base) {
            let ops = diff(&snapshot.data, &state.data);
            return SyncPayload::delta(state.state_id.clone(), base, state.version, ops);
        }

        debug!(
            "No retained baseline {} for {}, sending full state",
            base, state.state_id
        );
        full_payload(state)
    }
}

fn record_mut<'a>(inner: &'a mut EngineInner, state_id: &str) -> BridgeResult<&'a mut StateRecord> {
    inner
        .states
        .get_mut(state_id)
        .ok_or_else(|| BridgeError::not_found(NotFoundKind::State, state_id))
}

fn detach_session(sessions: &mut HashMap<SessionId, HashSet<StateId>>, session_id: &str, state_id: &str) {
    if let Some(states) = sessions.get_mut(session_id) {
        states.remove(state_id);
        if states.is_empty() {
            sessions.remove(session_id);
        }
    }
}

fn full_payload(state: &SyncState) -> SyncPayload {
    SyncPayload::full(state.state_id.clone(), state.version, state.data.clone())
}

/// Thread-safe engine wrapper
pub type SharedSyncEngine = Arc<SyncEngine>;

/// Create a shared sync engine
pub fn create_sync_engine(config: SyncConfig) -> SharedSyncEngine {
    Arc::new(SyncEngine::new(config))
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}
