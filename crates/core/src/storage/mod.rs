//! Storage helpers shared by every [`StorageAdapter`]
//!
//! Records are stored as JSON values; the typed helpers here handle the
//! serde step so components never touch raw values.

mod memory;

use std::collections::BTreeMap;

pub use memory::MemoryStorage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidemark_common::compression;
use tracing::warn;

use crate::ports::{Collection, StorageAdapter, StorageError, StorageResult};

/// Serialize and store a typed record
pub async fn put_record<T: Serialize + Sync>(
    storage: &dyn StorageAdapter,
    collection: Collection,
    key: &str,
    record: &T,
) -> StorageResult<()> {
    let value = serde_json::to_value(record)?;
    storage.store(collection, key, value).await
}

/// Load and deserialize a typed record
pub async fn get_record<T: DeserializeOwned>(
    storage: &dyn StorageAdapter,
    collection: Collection,
    key: &str,
) -> StorageResult<Option<T>> {
    match storage.retrieve(collection, key).await? {
        Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
            StorageError::Corrupt { collection, key: key.to_string(), message: e.to_string() }
        }),
        None => Ok(None),
    }
}

/// Load every decodable record in a collection
///
/// Records that fail to decode are skipped with a warning rather than
/// failing the whole load.
pub async fn load_records<T: DeserializeOwned>(
    storage: &dyn StorageAdapter,
    collection: Collection,
) -> StorageResult<Vec<T>> {
    let rows = storage.retrieve_all(collection).await?;
    let mut records = Vec::with_capacity(rows.len());
    for (key, value) in rows {
        match serde_json::from_value(value) {
            Ok(record) => records.push(record),
            Err(e) => warn!(%collection, key = %key, error = %e, "skipping undecodable record"),
        }
    }
    Ok(records)
}

/// Portable snapshot of a store, used by the backup format of every adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageDump {
    /// Collection name -> key -> record
    pub collections: BTreeMap<String, BTreeMap<String, Value>>,
    pub settings: BTreeMap<String, Value>,
}

impl StorageDump {
    /// Gzip-compressed JSON
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        Ok(compression::gzip(&json, compression::DEFAULT_LEVEL)?)
    }

    pub fn from_bytes(data: &[u8]) -> StorageResult<Self> {
        let json =
            compression::gunzip(data).map_err(|e| StorageError::InvalidBackup(e.to_string()))?;
        let dump: Self =
            serde_json::from_slice(&json).map_err(|e| StorageError::InvalidBackup(e.to_string()))?;
        if let Some(unknown) = dump.collections.keys().find(|name| Collection::from_name(name).is_none())
        {
            return Err(StorageError::InvalidBackup(format!("unknown collection '{unknown}'")));
        }
        Ok(dump)
    }

    /// Records of one collection, or an empty iterator
    pub fn records(&self, collection: Collection) -> impl Iterator<Item = (&String, &Value)> {
        self.collections.get(collection.as_str()).into_iter().flat_map(BTreeMap::iter)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn dump_survives_byte_encoding() {
        let mut dump = StorageDump::default();
        dump.collections
            .entry(Collection::Cache.as_str().to_string())
            .or_default()
            .insert("weather".into(), json!({"temp": 21}));
        dump.settings.insert("theme".into(), json!("dark"));

        let restored = StorageDump::from_bytes(&dump.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, dump);
        assert_eq!(restored.records(Collection::Cache).count(), 1);
        assert_eq!(restored.records(Collection::Operations).count(), 0);
    }

    #[test]
    fn dump_rejects_garbage_and_unknown_collections() {
        assert!(matches!(
            StorageDump::from_bytes(b"not gzip"),
            Err(StorageError::InvalidBackup(_))
        ));

        let mut dump = StorageDump::default();
        dump.collections.insert("mystery".into(), BTreeMap::new());
        let err = StorageDump::from_bytes(&dump.to_bytes().unwrap()).unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[tokio::test]
    async fn typed_helpers_skip_corrupt_rows() {
        let storage = MemoryStorage::new();
        put_record(&storage, Collection::Conflicts, "a", &json!({"n": 1})).await.unwrap();
        storage.store(Collection::Conflicts, "b", json!("not a map")).await.unwrap();

        let rows: Vec<BTreeMap<String, i64>> =
            load_records(&storage, Collection::Conflicts).await.unwrap();
        assert_eq!(rows.len(), 1);

        let corrupt: StorageResult<Option<BTreeMap<String, i64>>> =
            get_record(&storage, Collection::Conflicts, "b").await;
        assert!(matches!(corrupt, Err(StorageError::Corrupt { .. })));
    }
}
