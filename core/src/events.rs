//! Publish/subscribe registry for store and engine events
//!
//! Handlers are kept in registration order. Components enqueue events while
//! holding their own state lock and flush after releasing it, so a handler may
//! read from (or even mutate) the component that emitted the event.
//!
//! One thread delivers at a time. A flush that finds another thread
//! delivering waits for it, so once `flush` or `emit` returns every event
//! queued before the call has reached its handlers. A handler that emits on
//! the bus it is being called from returns at once; its events are delivered
//! by the outer loop after the current event has reached every handler.
//! Handlers must not wait on another thread that is itself flushing this bus.

use crate::traits::Event;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;
use tracing::warn;

/// Identifier returned on handler registration
pub type HandlerId = u64;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registration<E: Event> {
    id: HandlerId,
    /// `None` matches every kind
    kind: Option<E::Kind>,
    handler: Handler<E>,
}

/// Ordered event registry
pub struct EventBus<E: Event> {
    handlers: RwLock<Vec<Registration<E>>>,
    next_id: AtomicU64,
    /// Events applied but not yet delivered, in application order
    pending: Mutex<VecDeque<E>>,
    /// Held by the thread currently delivering `pending`
    draining: Mutex<()>,
    /// Thread holding `draining`
    drainer: Mutex<Option<ThreadId>>,
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            draining: Mutex::new(()),
            drainer: Mutex::new(None),
        }
    }

    /// Register a handler for one event kind
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> HandlerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register a handler for every event
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Remove a handler; returns false if it was not registered
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    /// Forward every event into a channel
    ///
    /// The channel is unbounded so the emitter never blocks and no event is
    /// lost while the receiver lags. Events are dropped only once the
    /// receiver has been closed.
    pub fn forward_to(&self, tx: mpsc::UnboundedSender<E>) -> HandlerId {
        self.on_any(move |event| {
            if tx.send(event.clone()).is_err() {
                warn!("Dropping {:?} event: receiver closed", event.kind());
            }
        })
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Queue an event for delivery
    pub fn enqueue(&self, event: E) {
        self.pending.lock().push_back(event);
    }

    /// Deliver queued events in order
    ///
    /// Blocks while another thread is delivering. Called from a handler of
    /// this bus, returns immediately and leaves the events to the outer call.
    pub fn flush(&self) {
        let me = thread::current().id();
        loop {
            let Some(guard) = self.draining.try_lock() else {
                if *self.drainer.lock() == Some(me) {
                    return;
                }
                // Wait out the other drainer, then deliver whatever it left
                drop(self.draining.lock());
                continue;
            };
            *self.drainer.lock() = Some(me);

            loop {
                let next = self.pending.lock().pop_front();
                match next {
                    Some(event) => self.dispatch(&event),
                    None => break,
                }
            }

            *self.drainer.lock() = None;
            drop(guard);

            // Something may have been queued between the last pop and the unlock
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }

    /// Enqueue and deliver a single event
    pub fn emit(&self, event: E) {
        self.enqueue(event);
        self.flush();
    }

    fn register(&self, kind: Option<E::Kind>, handler: Handler<E>) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push(Registration { id, kind, handler });
        id
    }

    fn dispatch(&self, event: &E) {
        let kind = event.kind();
        let matching: Vec<Handler<E>> = self
            .handlers
            .read()
            .iter()
            .filter(|r| r.kind.map_or(true, |k| k == kind))
            .map(|r| r.handler.clone())
            .collect();

        for handler in matching {
            handler(event);
        }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
