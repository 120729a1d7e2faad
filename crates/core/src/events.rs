//! Typed event bus shared by the engine components
//!
//! Handlers are synchronous and run on the emitting task, so they must be
//! quick; anything slow should be scheduled from the handler.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tidemark_common::Clock;
use tidemark_domain::{EngineEvent, EventKind, EventRecord};
use tracing::trace;

type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

struct Registration {
    id: u64,
    kind: Option<EventKind>,
    handler: Handler,
}

/// Bounded ring buffer of recent events
#[derive(Debug, Clone)]
pub struct EventHistory {
    capacity: usize,
    records: VecDeque<EventRecord>,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, records: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, record: EventRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

struct BusInner {
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
    handlers: RwLock<Vec<Registration>>,
    history: Mutex<EventHistory>,
}

impl BusInner {
    fn unsubscribe(&self, id: u64) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|registration| registration.id != id);
        handlers.len() != before
    }
}

/// Publish/subscribe hub for [`EngineEvent`]s
///
/// Cheap to clone; clones share handlers and history.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("history", &self.inner.history.lock().len())
            .finish()
    }
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>, history_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                clock,
                next_id: AtomicU64::new(1),
                handlers: RwLock::new(Vec::new()),
                history: Mutex::new(EventHistory::new(history_size)),
            }),
        }
    }

    /// Call `handler` for every event of `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Call `handler` for every event
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.write().push(Registration { id, kind, handler });
        Subscription { id, bus: Arc::downgrade(&self.inner) }
    }

    /// Record `event` in history and deliver it to matching handlers
    pub fn emit(&self, event: EngineEvent) {
        let kind = event.kind();
        trace!(event = %kind, "emitting engine event");

        // Handlers may subscribe or unsubscribe, so call them outside the lock
        let matching: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .iter()
            .filter(|registration| registration.kind.map_or(true, |k| k == kind))
            .map(|registration| Arc::clone(&registration.handler))
            .collect();

        for handler in matching {
            handler(&event);
        }

        let timestamp = self.inner.clock.millis_since_epoch();
        self.inner.history.lock().push(EventRecord { timestamp, event });
    }

    /// Recent events, oldest first
    pub fn history(&self) -> Vec<EventRecord> {
        self.inner.history.lock().snapshot()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

/// Registration handle returned by [`EventBus::on`] and [`EventBus::on_any`]
///
/// Dropping the handle keeps the handler registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Remove the handler; returns false if it was already gone
    pub fn unsubscribe(self) -> bool {
        self.bus.upgrade().is_some_and(|bus| bus.unsubscribe(self.id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tidemark_common::MockClock;
    use tidemark_domain::ConnectionQuality;

    use super::*;

    fn bus(history: usize) -> EventBus {
        EventBus::new(Arc::new(MockClock::starting_at(1_000)), history)
    }

    fn offline() -> EngineEvent {
        EngineEvent::OfflineDetected { at: 1_000 }
    }

    #[test]
    fn kind_handlers_only_see_their_kind() {
        let bus = bus(10);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = bus.on(EventKind::OfflineDetected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(offline());
        bus.emit(EngineEvent::SyncFailed { error: "boom".into() });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_any_sees_everything() {
        let bus = bus(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.on_any(move |event| sink.lock().push(event.kind()));

        bus.emit(offline());
        bus.emit(EngineEvent::NetworkQualityChanged {
            from: ConnectionQuality::Good,
            to: ConnectionQuality::Poor,
        });
        assert_eq!(
            *seen.lock(),
            vec![EventKind::OfflineDetected, EventKind::NetworkQualityChanged]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = bus(10);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = bus.on_any(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(offline());
        assert!(sub.unsubscribe());
        bus.emit(offline());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn history_is_bounded_and_timestamped() {
        let bus = bus(3);
        for at in 0..5 {
            bus.emit(EngineEvent::OfflineDetected { at });
        }
        let history = bus.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].event, EngineEvent::OfflineDetected { at: 2 });
        assert!(history.iter().all(|record| record.timestamp == 1_000));
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let bus = bus(10);
        let inner_bus = bus.clone();
        let _sub = bus.on(EventKind::OfflineDetected, move |_| {
            let _nested = inner_bus.on_any(|_| {});
        });
        bus.emit(offline());
        assert_eq!(bus.handler_count(), 2);
    }
}
