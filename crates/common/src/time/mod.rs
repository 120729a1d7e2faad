//! Time abstractions for the engine's timers
//!
//! - **[`clock`]**: wall-clock and monotonic time behind a trait, with a
//!   [`MockClock`] for tests
//! - **[`scheduler`]**: "run this closure after duration D" and "run this
//!   closure every period P", backed by tokio in production and by a virtual
//!   clock in tests
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tidemark_common::time::{Clock, MockClock};
//!
//! let clock = MockClock::starting_at(1_000);
//! clock.advance(Duration::from_millis(250));
//! assert_eq!(clock.millis_since_epoch(), 1_250);
//! ```

pub mod clock;
pub mod scheduler;

pub use clock::{Clock, MockClock, SystemClock};
pub use scheduler::{
    once, repeating, ManualScheduler, OnceTask, RepeatingTask, TaskFuture, TaskHandle,
    TaskScheduler, TokioScheduler,
};
