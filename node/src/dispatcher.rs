//! Pushes engine changes to subscribed sessions
//!
//! The dispatcher consumes [`SyncEvent`]s in emission order and keeps, per
//! session and state, the cursor (state generation and version) that session
//! last received. The first delivery to a session is a full payload; later
//! ones are deltas from the recorded cursor. A cursor left over from a deleted
//! state never seeds a delta against its replacement.

use async_trait::async_trait;
use enginelink_core::{SessionId, StateId, Version};
use enginelink_sync::{SharedSyncEngine, SyncCursor, SyncEvent, SyncPayload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound delivery to a connected session
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn send(&self, session_id: &str, payload: SyncPayload) -> anyhow::Result<()>;
}

/// Sink that records every delivery
#[derive(Default)]
pub struct MemorySessionSink {
    deliveries: Mutex<Vec<(SessionId, SyncPayload)>>,
}

impl MemorySessionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<(SessionId, SyncPayload)> {
        self.deliveries.lock().clone()
    }

    pub fn for_session(&self, session_id: &str) -> Vec<SyncPayload> {
        self.deliveries
            .lock()
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl SessionSink for MemorySessionSink {
    async fn send(&self, session_id: &str, payload: SyncPayload) -> anyhow::Result<()> {
        self.deliveries
            .lock()
            .push((session_id.to_string(), payload));
        Ok(())
    }
}

/// Sink that only logs deliveries; used when no transport is attached
#[derive(Default)]
pub struct LoggingSessionSink;

#[async_trait]
impl SessionSink for LoggingSessionSink {
    async fn send(&self, session_id: &str, payload: SyncPayload) -> anyhow::Result<()> {
        debug!(
            "-> {}: {} {} ({})",
            session_id,
            payload.state_id,
            payload.version,
            if payload.full_state { "full" } else { "delta" }
        );
        Ok(())
    }
}

/// Create the channel carrying engine events to the dispatcher
///
/// Unbounded: a lagging dispatcher must still see every change.
pub fn create_sync_channel() -> (
    mpsc::UnboundedSender<SyncEvent>,
    mpsc::UnboundedReceiver<SyncEvent>,
) {
    mpsc::unbounded_channel()
}

/// Event-driven payload fan-out
pub struct SyncDispatcher {
    engine: SharedSyncEngine,
    sink: Arc<dyn SessionSink>,
    /// session -> state -> last delivered cursor
    baselines: Mutex<HashMap<SessionId, HashMap<StateId, SyncCursor>>>,
}

impl SyncDispatcher {
    pub fn new(engine: SharedSyncEngine, sink: Arc<dyn SessionSink>) -> Self {
        Self {
            engine,
            sink,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    /// Process events until the channel closes
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SyncEvent>) {
        info!("Sync dispatcher started");
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
        info!("Sync dispatcher stopped");
    }

    pub async fn handle_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::StateCreated { state_id, .. } | SyncEvent::StateUpdated { state_id, .. } => {
                for session_id in self.engine.get_subscribers(&state_id) {
                    self.deliver(&session_id, &state_id).await;
                }
            }
            SyncEvent::StateDeleted { state_id, .. } => {
                // Sessions that unsubscribed earlier still hold a baseline
                let mut dropped = 0;
                for states in self.baselines.lock().values_mut() {
                    if states.remove(&state_id).is_some() {
                        dropped += 1;
                    }
                }
                debug!(
                    "State {} deleted, dropped {} session baselines",
                    state_id, dropped
                );
            }
            SyncEvent::ConflictDetected {
                state_id,
                expected,
                actual,
            } => {
                warn!(
                    "Conflict on {}: client at {}, state at {}",
                    state_id, expected, actual
                );
            }
            SyncEvent::SnapshotCaptured { state_id, version } => {
                debug!("Snapshot of {} at {}", state_id, version);
            }
        }
    }

    /// Send one session the changes since its baseline
    ///
    /// Returns false if nothing was sent.
    pub async fn deliver(&self, session_id: &str, state_id: &str) -> bool {
        let cursor = self.cursor(session_id, state_id);
        let Some((payload, next)) = self.engine.create_sync_payload_from(state_id, cursor) else {
            return false;
        };
        if cursor.map_or(false, |c| c.generation == next.generation && c.version >= next.version) {
            return false;
        }

        match self.sink.send(session_id, payload).await {
            Ok(()) => {
                self.baselines
                    .lock()
                    .entry(session_id.to_string())
                    .or_default()
                    .insert(state_id.to_string(), next);
                true
            }
            Err(e) => {
                // Next delivery starts over with a full payload
                warn!("Delivery of {} to {} failed: {}", state_id, session_id, e);
                if let Some(states) = self.baselines.lock().get_mut(session_id) {
                    states.remove(state_id);
                }
                false
            }
        }
    }

    /// Last version delivered to a session for a state
    pub fn baseline(&self, session_id: &str, state_id: &str) -> Option<Version> {
        self.cursor(session_id, state_id).map(|c| c.version)
    }

    pub fn cursor(&self, session_id: &str, state_id: &str) -> Option<SyncCursor> {
        self.baselines
            .lock()
            .get(session_id)
            .and_then(|states| states.get(state_id).copied())
    }

    /// Unsubscribe a session from one state and drop its baseline
    pub fn unsubscribe(&self, state_id: &str, session_id: &str) -> bool {
        let removed = self.engine.unsubscribe(state_id, session_id);
        let mut baselines = self.baselines.lock();
        if let Some(states) = baselines.get_mut(session_id) {
            states.remove(state_id);
            if states.is_empty() {
                baselines.remove(session_id);
            }
        }
        removed
    }

    /// Clean up after a disconnected session
    ///
    /// Returns the number of states it was unsubscribed from.
    pub fn forget_session(&self, session_id: &str) -> usize {
        self.baselines.lock().remove(session_id);
        let removed = self.engine.unsubscribe_all(session_id);
        info!("Session {} disconnected ({} subscriptions)", session_id, removed);
        removed
    }

    pub fn session_count(&self) -> usize {
        self.baselines.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginelink_sync::{Operation, OperationsPayload, SyncEngine};
    use serde_json::json;

    struct FailingSink;

    #[async_trait]
    impl SessionSink for FailingSink {
        async fn send(&self, _session_id: &str, _payload: SyncPayload) -> anyhow::Result<()> {
            anyhow::bail!("session closed")
        }
    }

    fn setup() -> (SharedSyncEngine, Arc<MemorySessionSink>, SyncDispatcher) {
        let engine = Arc::new(SyncEngine::default());
        let sink = Arc::new(MemorySessionSink::new());
        let dispatcher = SyncDispatcher::new(engine.clone(), sink.clone());
        (engine, sink, dispatcher)
    }

    async fn drain(dispatcher: &SyncDispatcher, rx: &mut mpsc::UnboundedReceiver<SyncEvent>) {
        while let Ok(event) = rx.try_recv() {
            dispatcher.handle_event(event).await;
        }
    }

    #[tokio::test]
    async fn test_first_delivery_is_full_then_delta() {
        let (engine, sink, dispatcher) = setup();
        let (tx, mut rx) = create_sync_channel();
        engine.events().forward_to(tx);

        engine.create_state("arena", json!({"round": 1})).unwrap();
        engine.subscribe("arena", "s1");
        drain(&dispatcher, &mut rx).await;

        engine.update_state("arena", json!({"round": 2}), None).unwrap();
        drain(&dispatcher, &mut rx).await;
        engine
            .apply_operations(
                "arena",
                &OperationsPayload::new("arena", Version::new(2), vec![Operation::add("/hp", json!(9))]),
            )
            .unwrap();
        drain(&dispatcher, &mut rx).await;

        let received = sink.for_session("s1");
        assert_eq!(received.len(), 3);
        assert!(received[0].full_state);
        assert!(!received[1].full_state);
        assert_eq!(received[2].base_version, Some(Version::new(2)));

        let mut doc = json!(null);
        for payload in &received {
            doc = payload.apply_to(&doc).unwrap();
        }
        assert_eq!(doc, engine.get_state("arena").unwrap().data);
        assert_eq!(dispatcher.baseline("s1", "arena"), Some(Version::new(3)));
    }

    #[tokio::test]
    async fn test_deleted_state_drops_baselines() {
        let (engine, _sink, dispatcher) = setup();
        let (tx, mut rx) = create_sync_channel();
        engine.events().forward_to(tx);

        engine.create_state("arena", json!({})).unwrap();
        engine.subscribe("arena", "s1");
        engine.update_state("arena", json!({"a": 1}), None).unwrap();
        drain(&dispatcher, &mut rx).await;
        assert!(dispatcher.baseline("s1", "arena").is_some());

        engine.delete_state("arena");
        drain(&dispatcher, &mut rx).await;
        assert!(dispatcher.baseline("s1", "arena").is_none());
    }

    #[tokio::test]
    async fn test_resubscribe_after_recreate_starts_from_full_state() {
        let (engine, sink, dispatcher) = setup();
        let (tx, mut rx) = create_sync_channel();
        engine.events().forward_to(tx);

        engine.create_state("arena", json!({"a": 1})).unwrap();
        engine.subscribe("arena", "s1");
        engine.update_state("arena", json!({"a": 2}), None).unwrap();
        engine.update_state("arena", json!({"a": 3}), None).unwrap();
        drain(&dispatcher, &mut rx).await;
        assert_eq!(dispatcher.baseline("s1", "arena"), Some(Version::new(3)));

        assert!(dispatcher.unsubscribe("arena", "s1"));
        assert!(dispatcher.baseline("s1", "arena").is_none());
        let seen = sink.for_session("s1").len();

        engine.subscribe("arena", "s2");
        drain(&dispatcher, &mut rx).await;
        engine.delete_state("arena");
        engine.create_state("arena", json!({"b": 1, "c": 0})).unwrap();
        engine.update_state("arena", json!({"b": 2, "c": 0}), None).unwrap();
        engine.update_state("arena", json!({"b": 2, "c": 5}), None).unwrap();
        engine.subscribe("arena", "s1");
        engine.update_state("arena", json!({"b": 3, "c": 5}), None).unwrap();
        drain(&dispatcher, &mut rx).await;

        let mut client = json!({"a": 3});
        let received = sink.for_session("s1");
        for payload in &received[seen..] {
            client = payload.apply_to(&client).unwrap();
        }
        assert!(received[seen].full_state);
        assert_eq!(client, engine.get_state("arena").unwrap().data);
    }

    #[tokio::test]
    async fn test_baseline_from_deleted_state_is_not_reused() {
        let (engine, sink, dispatcher) = setup();
        let (tx, mut rx) = create_sync_channel();
        engine.events().forward_to(tx);

        engine.create_state("arena", json!({"a": 1})).unwrap();
        engine.subscribe("arena", "s1");
        engine.update_state("arena", json!({"a": 2}), None).unwrap();
        drain(&dispatcher, &mut rx).await;

        // Unsubscribed behind the dispatcher's back
        engine.unsubscribe("arena", "s1");
        engine.delete_state("arena");
        engine.create_state("arena", json!({"b": 1})).unwrap();
        engine.subscribe("arena", "s1");
        engine.update_state("arena", json!({"b": 2}), None).unwrap();
        drain(&dispatcher, &mut rx).await;

        let received = sink.for_session("s1");
        let mut client = json!(null);
        for payload in &received {
            client = payload.apply_to(&client).unwrap();
        }
        assert_eq!(client, json!({"b": 2}));
        assert_eq!(
            dispatcher.cursor("s1", "arena").map(|c| c.generation),
            engine.get_state("arena").map(|s| s.generation)
        );
    }

    #[tokio::test]
    async fn test_lagging_dispatcher_sees_every_change() {
        let (engine, sink, dispatcher) = setup();
        let (tx, mut rx) = create_sync_channel();
        engine.events().forward_to(tx);

        engine.create_state("busy", json!({"n": 0})).unwrap();
        engine.create_state("quiet", json!({"n": 0})).unwrap();
        engine.subscribe("busy", "s1");
        engine.subscribe("quiet", "s1");
        drain(&dispatcher, &mut rx).await;

        // Thousands of queued events ahead of the only change to "quiet"
        for n in 1..=4096 {
            engine.update_state("busy", json!({"n": n}), None).unwrap();
        }
        engine.update_state("quiet", json!({"n": 1}), None).unwrap();
        drain(&dispatcher, &mut rx).await;

        let quiet: Vec<_> = sink
            .for_session("s1")
            .into_iter()
            .filter(|p| p.state_id == "quiet")
            .collect();
        let mut client = json!(null);
        for payload in &quiet {
            client = payload.apply_to(&client).unwrap();
        }
        assert_eq!(client, json!({"n": 1}));
        assert_eq!(dispatcher.baseline("s1", "quiet"), Some(Version::new(2)));
        assert_eq!(dispatcher.baseline("s1", "busy"), Some(Version::new(4097)));
    }

    #[tokio::test]
    async fn test_forget_session() {
        let (engine, sink, dispatcher) = setup();
        engine.create_state("a", json!({})).unwrap();
        engine.create_state("b", json!({})).unwrap();
        engine.subscribe("a", "s1");
        engine.subscribe("b", "s1");
        assert!(dispatcher.deliver("s1", "a").await);
        assert_eq!(dispatcher.session_count(), 1);

        assert_eq!(dispatcher.forget_session("s1"), 2);
        assert_eq!(dispatcher.session_count(), 0);

        engine.update_state("a", json!({"x": 1}), None).unwrap();
        dispatcher
            .handle_event(SyncEvent::StateUpdated {
                state_id: "a".into(),
                version: Version::new(2),
                data: json!({"x": 1}),
            })
            .await;
        assert_eq!(sink.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_up_to_date_session_is_skipped() {
        let (engine, sink, dispatcher) = setup();
        engine.create_state("arena", json!({})).unwrap();
        engine.subscribe("arena", "s1");

        assert!(dispatcher.deliver("s1", "arena").await);
        assert!(!dispatcher.deliver("s1", "arena").await);
        assert!(!dispatcher.deliver("s1", "ghost").await);
        assert_eq!(sink.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_no_baseline() {
        let engine = Arc::new(SyncEngine::default());
        let dispatcher = SyncDispatcher::new(engine.clone(), Arc::new(FailingSink));
        engine.create_state("arena", json!({})).unwrap();
        engine.subscribe("arena", "s1");

        assert!(!dispatcher.deliver("s1", "arena").await);
        assert!(dispatcher.baseline("s1", "arena").is_none());
    }

    #[tokio::test]
    async fn test_run_until_channel_closes() {
        let (engine, sink, dispatcher) = setup();
        engine.create_state("arena", json!({"n": 0})).unwrap();
        engine.subscribe("arena", "s1");

        let (tx, rx) = create_sync_channel();
        let handle = tokio::spawn(Arc::new(dispatcher).run(rx));

        tx.send(SyncEvent::StateCreated {
            state_id: "arena".into(),
            version: Version::new(1),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(sink.for_session("s1").len(), 1);
    }
}
