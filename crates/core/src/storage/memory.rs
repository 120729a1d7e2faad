use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::StorageDump;
use crate::ports::{Collection, StorageAdapter, StorageResult};

/// In-process storage backed by concurrent maps
///
/// Nothing survives the process; used for tests and for hosts that only
/// need the cache and queue for the session.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: DashMap<(Collection, String), Value>,
    settings: DashMap<String, Value>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records in one collection
    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.records.iter().filter(|entry| entry.key().0 == collection).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.settings.is_empty()
    }

    fn dump(&self) -> StorageDump {
        let mut dump = StorageDump::default();
        for entry in &self.records {
            let (collection, key) = entry.key();
            dump.collections
                .entry(collection.as_str().to_string())
                .or_default()
                .insert(key.clone(), entry.value().clone());
        }
        for entry in &self.settings {
            dump.settings.insert(entry.key().clone(), entry.value().clone());
        }
        dump
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn store(&self, collection: Collection, key: &str, value: Value) -> StorageResult<()> {
        self.records.insert((collection, key.to_string()), value);
        Ok(())
    }

    async fn retrieve(&self, collection: Collection, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.records.get(&(collection, key.to_string())).map(|r| r.value().clone()))
    }

    async fn retrieve_all(&self, collection: Collection) -> StorageResult<Vec<(String, Value)>> {
        let mut rows: Vec<(String, Value)> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    async fn remove(&self, collection: Collection, key: &str) -> StorageResult<bool> {
        Ok(self.records.remove(&(collection, key.to_string())).is_some())
    }

    async fn clear(&self, collection: Collection) -> StorageResult<()> {
        self.records.retain(|(c, _), _| *c != collection);
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.settings.get(key).map(|r| r.value().clone()))
    }

    async fn set_setting(&self, key: &str, value: Value) -> StorageResult<()> {
        self.settings.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_setting(&self, key: &str) -> StorageResult<()> {
        self.settings.remove(key);
        Ok(())
    }

    async fn backup(&self) -> StorageResult<Vec<u8>> {
        self.dump().to_bytes()
    }

    async fn restore(&self, data: &[u8]) -> StorageResult<()> {
        // Decode fully before touching current contents
        let dump = StorageDump::from_bytes(data)?;

        self.records.clear();
        self.settings.clear();
        for collection in Collection::ALL {
            for (key, value) in dump.records(collection) {
                self.records.insert((collection, key.clone()), value.clone());
            }
        }
        for (key, value) in dump.settings {
            self.settings.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let storage = MemoryStorage::new();
        storage.store(Collection::Operations, "op-1", json!({"id": "op-1"})).await.unwrap();

        let value = storage.retrieve(Collection::Operations, "op-1").await.unwrap();
        assert_eq!(value, Some(json!({"id": "op-1"})));
        assert_eq!(storage.retrieve(Collection::Cache, "op-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_collections_are_disjoint() {
        let storage = MemoryStorage::new();
        storage.store(Collection::Cache, "k", json!(1)).await.unwrap();
        storage.store(Collection::Conflicts, "k", json!(2)).await.unwrap();

        storage.clear(Collection::Cache).await.unwrap();
        assert_eq!(storage.len(Collection::Cache), 0);
        assert_eq!(storage.retrieve(Collection::Conflicts, "k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_retrieve_all_is_key_ordered() {
        let storage = MemoryStorage::new();
        for key in ["c", "a", "b"] {
            storage.store(Collection::Cache, key, json!(key)).await.unwrap();
        }
        let keys: Vec<_> = storage
            .retrieve_all(Collection::Cache)
            .await
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_remove_reports_presence() {
        let storage = MemoryStorage::new();
        storage.store(Collection::Cache, "k", json!(1)).await.unwrap();
        assert!(storage.remove(Collection::Cache, "k").await.unwrap());
        assert!(!storage.remove(Collection::Cache, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_backup_restore_replaces_contents() {
        let source = MemoryStorage::new();
        source.store(Collection::Operations, "op-1", json!({"n": 1})).await.unwrap();
        source.set_setting("tidemark.offline_state", json!({"isOnline": true})).await.unwrap();
        let backup = source.backup().await.unwrap();

        let target = MemoryStorage::new();
        target.store(Collection::Cache, "stale", json!(0)).await.unwrap();
        target.restore(&backup).await.unwrap();

        assert_eq!(target.len(Collection::Cache), 0);
        assert_eq!(target.retrieve(Collection::Operations, "op-1").await.unwrap(), Some(json!({"n": 1})));
        assert!(target.get_setting("tidemark.offline_state").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_contents() {
        let storage = MemoryStorage::new();
        storage.store(Collection::Cache, "k", json!(1)).await.unwrap();
        assert!(storage.restore(b"garbage").await.is_err());
        assert_eq!(storage.len(Collection::Cache), 1);
    }
}
