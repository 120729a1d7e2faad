//! Deferred and periodic task execution
//!
//! Every timer in the engine (queue drain, retry backoff, completed-entry
//! cleanup, cache prune, prefetch workers, auto-sync, connectivity probe,
//! metrics snapshot) is expressed as a [`OnceTask`] or [`RepeatingTask`]
//! handed to a [`TaskScheduler`].
//!
//! - [`TokioScheduler`] spawns onto the ambient tokio runtime and sleeps for
//!   real.
//! - [`ManualScheduler`] keeps tasks in a list keyed by virtual deadline and
//!   only runs them when a test calls [`ManualScheduler::advance`].
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tidemark_common::time::{once, ManualScheduler, MockClock, TaskScheduler};
//!
//! # tokio_test::block_on(async {
//! let scheduler = ManualScheduler::new(MockClock::new());
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = fired.clone();
//! scheduler.schedule_once(
//!     "example",
//!     Duration::from_secs(5),
//!     once(move || async move {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     }),
//! );
//!
//! scheduler.advance(Duration::from_secs(4)).await;
//! assert_eq!(fired.load(Ordering::SeqCst), 0);
//! scheduler.advance(Duration::from_secs(1)).await;
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::clock::MockClock;

/// Future produced by a scheduled task
pub type TaskFuture = BoxFuture<'static, ()>;

/// Closure run once after a delay
pub type OnceTask = Box<dyn FnOnce() -> TaskFuture + Send>;

/// Closure run on every period tick
pub type RepeatingTask = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Shortest period accepted for repeating tasks
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Box an async closure as a [`OnceTask`]
pub fn once<F, Fut>(f: F) -> OnceTask
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Wrap an async closure as a [`RepeatingTask`]
pub fn repeating<F, Fut>(f: F) -> RepeatingTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Cancellation handle returned for every scheduled task
///
/// Cancelling prevents future runs; a run already in progress completes.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    token: CancellationToken,
}

impl TaskHandle {
    fn new(name: &str, token: CancellationToken) -> Self {
        Self { name: Arc::from(name), token }
    }

    /// Cancel the task
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if the task has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Name the task was scheduled under
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Runs closures after a delay or on a fixed period
pub trait TaskScheduler: Send + Sync {
    /// Run `task` once, `delay` from now
    fn schedule_once(&self, name: &str, delay: Duration, task: OnceTask) -> TaskHandle;

    /// Run `task` every `period`, first run one period from now
    fn schedule_repeating(&self, name: &str, period: Duration, task: RepeatingTask)
        -> TaskHandle;
}

impl fmt::Debug for dyn TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskScheduler")
    }
}

/// Production scheduler backed by tokio timers
///
/// Each task runs on its own spawned future. A repeating task awaits its own
/// run before waiting for the next tick, so one task never overlaps itself.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    root: CancellationToken,
}

impl TokioScheduler {
    /// Create a scheduler with its own root cancellation token
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every task this scheduler has spawned
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    fn runtime(name: &str, handle: &TaskHandle) -> Option<tokio::runtime::Handle> {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime),
            Err(_) => {
                warn!(task = name, "no tokio runtime available; task dropped");
                handle.cancel();
                None
            }
        }
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule_once(&self, name: &str, delay: Duration, task: OnceTask) -> TaskHandle {
        let token = self.root.child_token();
        let handle = TaskHandle::new(name, token.clone());
        let Some(runtime) = Self::runtime(name, &handle) else {
            return handle;
        };

        let task_name = handle.name.clone();
        runtime.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(task = %task_name, "scheduled task cancelled");
                }
                () = tokio::time::sleep(delay) => {
                    task().await;
                }
            }
        });
        handle
    }

    fn schedule_repeating(
        &self,
        name: &str,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle {
        let token = self.root.child_token();
        let handle = TaskHandle::new(name, token.clone());
        let Some(runtime) = Self::runtime(name, &handle) else {
            return handle;
        };

        let period = period.max(MIN_PERIOD);
        let task_name = handle.name.clone();
        runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!(task = %task_name, "repeating task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        task().await;
                    }
                }
            }
        });
        handle
    }
}

enum ManualTask {
    Once(OnceTask),
    Repeating { period: Duration, task: RepeatingTask },
}

struct ManualEntry {
    seq: u64,
    due: Duration,
    handle: TaskHandle,
    task: ManualTask,
}

#[derive(Default)]
struct ManualState {
    next_seq: u64,
    entries: Vec<ManualEntry>,
}

impl ManualState {
    fn push(&mut self, due: Duration, handle: TaskHandle, task: ManualTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(ManualEntry { seq, due, handle, task });
    }

    /// Remove and return the earliest task due at or before `limit`
    fn pop_due(&mut self, limit: Duration) -> Option<(Duration, TaskHandle, DueTask)> {
        self.entries.retain(|entry| !entry.handle.is_cancelled());

        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.due <= limit)
            .min_by_key(|(_, entry)| (entry.due, entry.seq))
            .map(|(index, _)| index)?;

        let entry = self.entries.swap_remove(index);
        let due_task = match entry.task {
            ManualTask::Once(task) => DueTask::Once(task),
            ManualTask::Repeating { period, task } => {
                self.push(
                    entry.due + period,
                    entry.handle.clone(),
                    ManualTask::Repeating { period, task: task.clone() },
                );
                DueTask::Repeating(task)
            }
        };
        Some((entry.due, entry.handle, due_task))
    }
}

enum DueTask {
    Once(OnceTask),
    Repeating(RepeatingTask),
}

/// Virtual-time scheduler for tests
///
/// Tasks run only inside [`advance`](Self::advance), in deadline order, with
/// the shared [`MockClock`] moved to each task's deadline before it runs.
/// Tasks scheduled by a running task are picked up in the same call if they
/// fall due before the advance target.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: MockClock,
    state: Arc<Mutex<ManualState>>,
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("elapsed", &self.clock.elapsed())
            .field("pending", &self.pending_tasks())
            .finish()
    }
}

impl ManualScheduler {
    /// Scheduler driven by `clock`
    pub fn new(clock: MockClock) -> Self {
        Self { clock, state: Arc::new(Mutex::new(ManualState::default())) }
    }

    /// The clock this scheduler advances
    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    /// Number of live (not cancelled) scheduled tasks
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().entries.iter().filter(|entry| !entry.handle.is_cancelled()).count()
    }

    /// Move virtual time forward by `by`, running every task that falls due
    ///
    /// Returns the number of task runs performed.
    pub async fn advance(&self, by: Duration) -> usize {
        let target = self.clock.elapsed() + by;
        let mut runs = 0;

        loop {
            let next = self.state.lock().pop_due(target);
            let Some((due, handle, task)) = next else {
                break;
            };

            if due > self.clock.elapsed() {
                self.clock.set_elapsed(due);
            }
            debug!(task = handle.name(), due_ms = due.as_millis() as u64, "manual task due");

            match task {
                DueTask::Once(task) => task().await,
                DueTask::Repeating(task) => task().await,
            }
            runs += 1;
        }

        if target > self.clock.elapsed() {
            self.clock.set_elapsed(target);
        }
        runs
    }

    /// Run everything already due without moving time
    pub async fn run_due(&self) -> usize {
        self.advance(Duration::ZERO).await
    }
}

impl TaskScheduler for ManualScheduler {
    fn schedule_once(&self, name: &str, delay: Duration, task: OnceTask) -> TaskHandle {
        let handle = TaskHandle::new(name, CancellationToken::new());
        let due = self.clock.elapsed() + delay;
        self.state.lock().push(due, handle.clone(), ManualTask::Once(task));
        handle
    }

    fn schedule_repeating(
        &self,
        name: &str,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new(name, CancellationToken::new());
        let period = period.max(MIN_PERIOD);
        let due = self.clock.elapsed() + period;
        self.state.lock().push(due, handle.clone(), ManualTask::Repeating { period, task });
        handle
    }
}
