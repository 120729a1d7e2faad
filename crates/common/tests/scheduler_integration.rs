//! Integration tests for the virtual-time scheduler working with the mock
//! clock the way engine components use them together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tidemark_common::time::{once, repeating, Clock, ManualScheduler, MockClock, TaskScheduler};
use tidemark_common::ExponentialBackoff;

/// A retry chain where each failed run schedules the next attempt after the
/// backoff delay, mirroring how the queue reschedules operations.
#[tokio::test]
async fn backoff_chain_runs_at_expected_virtual_times() {
    let clock = MockClock::starting_at(0);
    let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
    let backoff = ExponentialBackoff::fixed(Duration::from_secs(1), 2.0, Duration::from_secs(5));
    let attempts = Arc::new(support::Log::default());

    fn schedule_attempt(
        scheduler: Arc<ManualScheduler>,
        clock: MockClock,
        backoff: ExponentialBackoff,
        log: Arc<support::Log>,
        attempt: u32,
    ) {
        let delay = backoff.base_delay(attempt);
        let inner = scheduler.clone();
        scheduler.schedule_once(
            "retry",
            delay,
            once(move || async move {
                log.push(clock.millis_since_epoch());
                if attempt < 4 {
                    schedule_attempt(inner, clock, backoff, log, attempt + 1);
                }
            }),
        );
    }

    schedule_attempt(scheduler.clone(), clock.clone(), backoff, attempts.clone(), 1);
    scheduler.advance(Duration::from_secs(60)).await;

    // 1s, then +2s, +4s, +5s (capped)
    assert_eq!(attempts.snapshot(), vec![1_000, 3_000, 7_000, 12_000]);
}

#[tokio::test]
async fn repeating_and_one_shot_tasks_interleave_by_deadline() {
    let clock = MockClock::starting_at(0);
    let scheduler = ManualScheduler::new(clock.clone());
    let log = Arc::new(support::Log::default());

    let tick_log = log.clone();
    let tick_clock = clock.clone();
    scheduler.schedule_repeating(
        "drain",
        Duration::from_secs(5),
        repeating(move || {
            let log = tick_log.clone();
            let clock = tick_clock.clone();
            async move { log.push(clock.millis_since_epoch()) }
        }),
    );

    let once_log = log.clone();
    let once_clock = clock.clone();
    scheduler.schedule_once(
        "cleanup",
        Duration::from_secs(7),
        once(move || async move { once_log.push(once_clock.millis_since_epoch() + 1) }),
    );

    scheduler.advance(Duration::from_secs(15)).await;
    assert_eq!(log.snapshot(), vec![5_000, 7_001, 10_000, 15_000]);
    assert_eq!(scheduler.pending_tasks(), 1);
}

#[tokio::test]
async fn run_due_does_not_move_time() {
    let clock = MockClock::starting_at(0);
    let scheduler = ManualScheduler::new(clock.clone());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    scheduler.schedule_once(
        "immediate",
        Duration::ZERO,
        once(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert_eq!(scheduler.run_due().await, 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

mod support {
    use std::sync::Mutex;

    /// Append-only log shared between tasks and assertions
    #[derive(Default)]
    pub struct Log(Mutex<Vec<u64>>);

    impl Log {
        pub fn push(&self, value: u64) {
            self.0.lock().unwrap().push(value);
        }

        pub fn snapshot(&self) -> Vec<u64> {
            self.0.lock().unwrap().clone()
        }
    }
}
