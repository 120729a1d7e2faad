//! Engine-wide constants
//!
//! Storage layout names are part of the persisted format; changing them
//! orphans existing data.

// Storage collections
pub const COLLECTION_OPERATIONS: &str = "operations";
pub const COLLECTION_CACHE: &str = "cache";
pub const COLLECTION_SYNC_BATCHES: &str = "sync-batches";
pub const COLLECTION_CONFLICTS: &str = "conflicts";
pub const COLLECTION_RESOLVED_CONFLICTS: &str = "resolved-conflicts";

// Settings keys
pub const SETTINGS_OFFLINE_STATE: &str = "tidemark.offline_state";
pub const SETTINGS_DIAGNOSTICS_PROBE: &str = "tidemark.diagnostics_probe";

// Cache keys reserved for diagnostics
pub const DIAGNOSTICS_CACHE_KEY: &str = "__tidemark_diagnostics__";

// Backup format
pub const BACKUP_FORMAT_VERSION: u32 = 1;

// Defaults
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_EVENT_HISTORY: usize = 100;
pub const DEFAULT_TIMESTAMP_FIELD: &str = "updatedAt";
