//! r2d2 pool over SQLite connections

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{info, instrument};

use crate::config::StorageConfig;
use crate::errors::InfraResult;

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Build a pool for `config.path`, or a single-connection in-memory pool
///
/// Every in-memory connection is its own database, so the memory pool is
/// capped at one connection regardless of `pool_size`.
#[instrument(skip(config), fields(db_path = ?config.path, pool_size = config.pool_size))]
pub fn create_pool(config: &StorageConfig) -> InfraResult<SqlitePool> {
    let busy_timeout = config.busy_timeout;
    let (manager, max_size, wal) = match &config.path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            (SqliteConnectionManager::file(path), config.pool_size.max(1), config.enable_wal)
        }
        None => (SqliteConnectionManager::memory(), 1, false),
    };

    let manager = manager.with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        if wal {
            enable_wal(conn)?;
        }
        Ok(())
    });

    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(config.connection_timeout)
        .build(manager)?;

    info!(max_connections = max_size, wal, "sqlite pool initialised");
    Ok(pool)
}

fn enable_wal(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode answers with the mode actually applied
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn file_pool_uses_wal() {
        let dir = TempDir::new().expect("temp dir created");
        let config = StorageConfig {
            path: Some(dir.path().join("nested").join("engine.db")),
            ..StorageConfig::default()
        };

        let pool = create_pool(&config).expect("pool created");
        let conn = pool.get().expect("connection acquired");
        let mode: String =
            conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).expect("pragma");
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        assert_eq!(pool.max_size(), config.pool_size);
    }

    #[test]
    fn memory_pool_is_single_connection() {
        let config = StorageConfig { pool_size: 8, ..StorageConfig::default() };
        let pool = create_pool(&config).expect("pool created");
        assert_eq!(pool.max_size(), 1);
    }
}
