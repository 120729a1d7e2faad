//! Operation queue
//!
//! Durable store of pending local mutations with priority ordering,
//! exponential-backoff retries and crash recovery.

mod core;
mod errors;
mod stats;

pub use self::core::{DrainReport, FailureDisposition, OperationQueue, CONFLICT_METADATA_KEY};
pub use errors::{QueueError, QueueResult};
pub use stats::QueueStats;
