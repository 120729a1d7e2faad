//! SQLite persistence

pub mod pool;
mod sqlite;

pub use pool::{create_pool, SqlitePool};
pub use sqlite::SqliteStorage;
