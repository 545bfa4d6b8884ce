use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Storage, StorageError};

/// Process-local store for tests and the development daemon
///
/// Entries are kept ordered so prefix listing is a range scan.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        drop(self.entries.write().insert(key.to_owned(), value.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        drop(self.entries.write().remove(key));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.read().contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read();
        let keys = entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let storage = MemoryStorage::new();

        storage.set("key:k1", b"record").await.unwrap();
        assert_eq!(storage.get("key:k1").await.unwrap(), Some(b"record".to_vec()));
        assert!(storage.exists("key:k1").await.unwrap());
        assert!(!storage.exists("key:k2").await.unwrap());

        storage.delete("key:k1").await.unwrap();
        assert_eq!(storage.get("key:k1").await.unwrap(), None);
        storage.delete("key:k1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let storage = MemoryStorage::new();
        for key in ["key:b", "identity:u1", "key:a", "keys", "kez:c"] {
            storage.set(key, b"x").await.unwrap();
        }

        let keys = storage.list_keys("key:").await.unwrap();
        assert_eq!(keys, vec!["key:a".to_owned(), "key:b".to_owned()]);
        assert_eq!(storage.list_keys("").await.unwrap().len(), 5);
    }
}
