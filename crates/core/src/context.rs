//! Shared runtime services injected into every component

use std::sync::Arc;

use tidemark_common::{Clock, ManualScheduler, MockClock, SystemClock, TaskScheduler, TokioScheduler};
use tidemark_domain::constants::DEFAULT_EVENT_HISTORY;

use crate::events::EventBus;

/// Clock, scheduler and event bus shared by queue, cache, sync and
/// orchestrator
#[derive(Clone)]
pub struct EngineContext {
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub events: EventBus,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("now_ms", &self.now_ms())
            .field("scheduler", &self.scheduler)
            .field("events", &self.events)
            .finish()
    }
}

impl EngineContext {
    pub fn new(clock: Arc<dyn Clock>, scheduler: Arc<dyn TaskScheduler>, events: EventBus) -> Self {
        Self { clock, scheduler, events }
    }

    /// Real clock and tokio-backed scheduler
    pub fn production(event_history: usize) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::new(Arc::clone(&clock), event_history);
        Self::new(clock, Arc::new(TokioScheduler::new()), events)
    }

    /// Virtual-time context; the returned scheduler drives the clock
    pub fn manual(start_millis: u64) -> (Self, ManualScheduler) {
        let clock = MockClock::starting_at(start_millis);
        let scheduler = ManualScheduler::new(clock.clone());
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let events = EventBus::new(Arc::clone(&clock), DEFAULT_EVENT_HISTORY);
        (Self::new(clock, Arc::new(scheduler.clone()), events), scheduler)
    }

    /// Wall-clock milliseconds since the epoch
    pub fn now_ms(&self) -> u64 {
        self.clock.millis_since_epoch()
    }
}
