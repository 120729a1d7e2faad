//! Domain records

pub mod cache;
pub mod operation;
pub mod state;
pub mod sync;

use std::collections::BTreeMap;

pub use cache::{CacheEntry, CacheStrategy, CachedValue};
pub use operation::{NewOperation, Operation, OperationFilter, OperationStatus, Priority};
pub use state::{
    ConnectionQuality, ConnectivityStatus, NetworkSnapshot, OfflineState, StorageSnapshot,
};
pub use sync::{
    Conflict, ConflictResolution, ResolutionStrategy, SyncBatch, SyncOptions, SyncReport,
};

/// Free-form metadata attached to operations and cache entries
pub type Metadata = BTreeMap<String, serde_json::Value>;
