//! Sync coordinator
//!
//! Claims eligible operations from the queue, sends them to the
//! [`RemoteExecutor`](crate::ports::RemoteExecutor) in batches and turns
//! conflict outcomes into [`Conflict`](tidemark_domain::Conflict) records
//! that stay parked until resolved.

mod conflict;
mod coordinator;
mod errors;

pub use coordinator::{ResolutionSummary, SyncCoordinator, SyncStatus};
pub use errors::{SyncError, SyncResult};
