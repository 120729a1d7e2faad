//! # Tidemark Infrastructure
//!
//! Infrastructure implementations of the `tidemark-core` ports.
//!
//! This crate contains:
//! - SQLite storage (rusqlite + r2d2)
//! - HTTP connectivity probing (reqwest)
//! - In-process background channels
//! - Configuration loading, tracing setup and the [`EngineBuilder`]
//!
//! ## Architecture
//! - Implements traits defined in `tidemark-core::ports`
//! - Contains all "impure" code (files, sockets, global subscribers)

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod connectivity;
pub mod database;
pub mod errors;
pub mod logging;

// Re-export commonly used items
pub use bootstrap::EngineBuilder;
pub use channel::InProcessChannel;
pub use config::{ConfigLoader, InfraConfig, LogFormat, LoggingConfig, ProbeConfig, StorageConfig};
pub use connectivity::{HttpConnectivityMonitor, QualityThresholds};
pub use database::SqliteStorage;
pub use errors::{InfraError, InfraResult};
pub use logging::init_tracing;
