//! Retry timing
//!
//! Only the delay math lives here; deciding *when* an operation is retried
//! belongs to the queue that owns it.

pub mod backoff;

pub use backoff::ExponentialBackoff;
