//! # Tidemark Core
//!
//! Offline-first engine: a durable operation queue, a strategy-driven cache
//! and a sync coordinator, orchestrated around connectivity.
//!
//! ## Architecture Principles
//! - Only depends on `tidemark-common` and `tidemark-domain`
//! - Storage, remote execution, connectivity and peer messaging are ports
//!   (see [`ports`]); concrete adapters live in `tidemark-infra`
//! - Time and background work go through the [`EngineContext`] so tests can
//!   drive them deterministically

pub mod cache;
pub mod context;
pub mod events;
pub mod orchestrator;
pub mod ports;
pub mod queue;
pub mod storage;
pub mod sync;

mod guard;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cache::{GetOptions, OfflineCache, SetOptions};
pub use context::EngineContext;
pub use events::{EventBus, Subscription};
pub use orchestrator::{EngineError, EngineResult, ErrorKind, OfflineEngine};
pub use ports::{
    BackgroundChannel, BackgroundMessage, Collection, ConflictResolver, ConnectivityMonitor,
    ExecutionOutcome, RemoteExecutor, StorageAdapter, StorageError, TransportError,
};
pub use queue::OperationQueue;
pub use storage::MemoryStorage;
pub use sync::SyncCoordinator;
