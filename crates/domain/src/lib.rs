//! # Tidemark Domain
//!
//! Data model shared by the engine and its adapters.
//!
//! This crate contains:
//! - Queue, cache and sync records ([`Operation`], [`CacheEntry`],
//!   [`SyncBatch`], [`Conflict`])
//! - The aggregate [`OfflineState`] and connectivity types
//! - The closed [`EngineEvent`] taxonomy
//! - Configuration structures with defaults
//!
//! ## Architecture
//! - Depends only on `tidemark-common` (foundation tier)
//! - Plain data: no I/O, no async

pub mod config;
pub mod constants;
pub mod events;
pub mod macros;
pub mod types;

pub use config::*;
pub use events::{EngineEvent, EventKind, EventRecord};
pub use types::*;
