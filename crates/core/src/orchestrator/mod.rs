//! Offline orchestrator
//!
//! Ties the queue, cache and sync coordinator to connectivity. Owns the
//! aggregate [`OfflineState`](tidemark_domain::OfflineState), pauses the
//! queue while offline, syncs on reconnect, and exposes diagnostics and
//! backup/restore.

mod backup;
mod core;
mod diagnostics;
mod errors;
mod metrics;

pub use self::core::OfflineEngine;
pub use backup::Backup;
pub use diagnostics::{CheckResult, Diagnostics, DiagnosticsReport, EngineStats};
pub use errors::{EngineError, EngineResult, ErrorKind};
pub use metrics::MetricsSnapshot;
