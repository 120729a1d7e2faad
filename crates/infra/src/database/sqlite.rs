//! SQLite-backed [`StorageAdapter`]
//!
//! All collections share one `records` table keyed by `(collection, key)`;
//! settings live in their own table. Values are stored as JSON text. Every
//! call runs on the blocking pool with a pooled connection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tidemark_core::ports::{Collection, StorageAdapter, StorageError, StorageResult};
use tidemark_core::storage::StorageDump;
use tracing::{debug, info, instrument, warn};

use super::pool::{create_pool, SqlitePool};
use crate::config::StorageConfig;
use crate::errors::{join_error, pool_error, sql_error, InfraResult};

const SCHEMA_VERSION: i32 = 1;
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Durable store over an r2d2 SQLite pool
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.path)
            .field("max_connections", &self.pool.max_size())
            .finish()
    }
}

impl SqliteStorage {
    /// Open (or create) the database described by `config`
    ///
    /// The schema is created by [`StorageAdapter::initialize`], which the
    /// engine calls during startup.
    pub fn open(config: &StorageConfig) -> InfraResult<Self> {
        let pool = create_pool(config)?;
        Ok(Self { pool, path: config.path.clone() })
    }

    /// Private in-memory database
    pub fn in_memory() -> InfraResult<Self> {
        Self::open(&StorageConfig::default())
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquire a connection and run a trivial query
    pub async fn health_check(&self) -> StorageResult<()> {
        self.with_conn("health_check", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0)).map(|_| ())
        })
        .await
    }

    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> StorageResult<T> {
            let mut conn = pool.get().map_err(pool_error)?;
            f(&mut conn).map_err(|e| sql_error(operation, e))
        })
        .await
        .map_err(join_error)?
    }

    async fn dump(&self) -> StorageResult<StorageDump> {
        let (records, settings) = self
            .with_conn("backup", |conn| {
                let tx = conn.transaction()?;
                let records = {
                    let mut stmt = tx.prepare(
                        "SELECT collection, key, value FROM records ORDER BY collection, key",
                    )?;
                    let rows = stmt.query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                let settings = {
                    let mut stmt = tx.prepare("SELECT key, value FROM settings ORDER BY key")?;
                    let rows = stmt.query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                tx.commit()?;
                Ok((records, settings))
            })
            .await?;

        let mut dump = StorageDump::default();
        for (collection, key, text) in records {
            let Some(parsed) = Collection::from_name(&collection) else {
                warn!(%collection, key = %key, "skipping record in unknown collection");
                continue;
            };
            let value = decode(parsed, &key, &text)?;
            dump.collections.entry(collection).or_default().insert(key, value);
        }
        for (key, text) in settings {
            let value = serde_json::from_str(&text)?;
            dump.settings.insert(key, value);
        }
        Ok(dump)
    }
}

fn decode(collection: Collection, key: &str, text: &str) -> StorageResult<Value> {
    serde_json::from_str(text).map_err(|e| StorageError::Corrupt {
        collection,
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    #[instrument(skip(self), fields(db_path = ?self.path))]
    async fn initialize(&self) -> StorageResult<()> {
        self.with_conn("migrate", |conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now_millis()],
            )?;
            Ok(())
        })
        .await?;
        info!(schema_version = SCHEMA_VERSION, "sqlite storage ready");
        Ok(())
    }

    async fn store(&self, collection: Collection, key: &str, value: Value) -> StorageResult<()> {
        let text = serde_json::to_string(&value)?;
        let key = key.to_string();
        self.with_conn("store", move |conn| {
            conn.execute(
                "INSERT INTO records (collection, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (collection, key)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![collection.as_str(), key, text, now_millis()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn retrieve(&self, collection: Collection, key: &str) -> StorageResult<Option<Value>> {
        let owned = key.to_string();
        let text = self
            .with_conn("retrieve", move |conn| {
                conn.query_row(
                    "SELECT value FROM records WHERE collection = ?1 AND key = ?2",
                    params![collection.as_str(), owned],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;
        text.map(|text| decode(collection, key, &text)).transpose()
    }

    async fn retrieve_all(&self, collection: Collection) -> StorageResult<Vec<(String, Value)>> {
        let rows = self
            .with_conn("retrieve_all", move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT key, value FROM records WHERE collection = ?1 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![collection.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (key, text) in rows {
            match decode(collection, &key, &text) {
                Ok(value) => records.push((key, value)),
                Err(e) => warn!(%collection, key = %key, error = %e, "skipping unreadable row"),
            }
        }
        Ok(records)
    }

    async fn remove(&self, collection: Collection, key: &str) -> StorageResult<bool> {
        let key = key.to_string();
        self.with_conn("remove", move |conn| {
            conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                params![collection.as_str(), key],
            )
            .map(|removed| removed > 0)
        })
        .await
    }

    async fn clear(&self, collection: Collection) -> StorageResult<()> {
        let removed = self
            .with_conn("clear", move |conn| {
                conn.execute("DELETE FROM records WHERE collection = ?1", params![collection.as_str()])
            })
            .await?;
        debug!(%collection, removed, "collection cleared");
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<Value>> {
        let key = key.to_string();
        let text = self
            .with_conn("get_setting", move |conn| {
                conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                    row.get::<_, String>(0)
                })
                .optional()
            })
            .await?;
        Ok(text.map(|text| serde_json::from_str(&text)).transpose()?)
    }

    async fn set_setting(&self, key: &str, value: Value) -> StorageResult<()> {
        let text = serde_json::to_string(&value)?;
        let key = key.to_string();
        self.with_conn("set_setting", move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, text, now_millis()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn remove_setting(&self, key: &str) -> StorageResult<()> {
        let key = key.to_string();
        self.with_conn("remove_setting", move |conn| {
            conn.execute("DELETE FROM settings WHERE key = ?1", params![key]).map(|_| ())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn backup(&self) -> StorageResult<Vec<u8>> {
        let dump = self.dump().await?;
        let bytes = dump.to_bytes()?;
        info!(
            collections = dump.collections.len(),
            settings = dump.settings.len(),
            bytes = bytes.len(),
            "storage snapshot taken"
        );
        Ok(bytes)
    }

    /// Replaces every record and setting in one transaction
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn restore(&self, data: &[u8]) -> StorageResult<()> {
        let dump = StorageDump::from_bytes(data)?;

        let mut records = Vec::new();
        for (collection, rows) in &dump.collections {
            for (key, value) in rows {
                records.push((collection.clone(), key.clone(), serde_json::to_string(value)?));
            }
        }
        let mut settings = Vec::with_capacity(dump.settings.len());
        for (key, value) in &dump.settings {
            settings.push((key.clone(), serde_json::to_string(value)?));
        }
        let restored = records.len();

        self.with_conn("restore", move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM records", [])?;
            tx.execute("DELETE FROM settings", [])?;
            let now = now_millis();
            {
                let mut insert = tx.prepare(
                    "INSERT INTO records (collection, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (collection, key, text) in &records {
                    insert.execute(params![collection, key, text, now])?;
                }
                let mut insert = tx
                    .prepare("INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)")?;
                for (key, text) in &settings {
                    insert.execute(params![key, text, now])?;
                }
            }
            tx.commit()
        })
        .await?;

        info!(records = restored, "storage restored from snapshot");
        Ok(())
    }
}
