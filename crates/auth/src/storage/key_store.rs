use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::storage::models::{prefixes, Key, KeyRecord};
use crate::storage::{deserialize, serialize, Storage, StorageError};

/// Persistence contract for issued keys
///
/// Only derivable facts are stored; the signed secret never reaches the store.
#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Persist a freshly issued key
    async fn save(&self, key: &Key) -> Result<(), StorageError>;

    /// Look a key up by ID, failing with [`StorageError::NotFound`]
    async fn retrieve(&self, id: &str) -> Result<KeyRecord, StorageError>;

    /// Mark a key revoked. Revoking a missing or already revoked key succeeds.
    async fn revoke(&self, id: &str) -> Result<(), StorageError>;
}

/// [`KeyStore`] backed by any [`Storage`] implementation
#[derive(Clone)]
pub struct StorageKeyStore {
    storage: Arc<dyn Storage>,
}

impl fmt::Debug for StorageKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageKeyStore").finish_non_exhaustive()
    }
}

impl StorageKeyStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn storage_key(id: &str) -> String {
        format!("{}{}", prefixes::KEY, id)
    }

    async fn put(&self, record: &KeyRecord) -> Result<(), StorageError> {
        let value = serialize(record)?;
        self.storage
            .set(&Self::storage_key(&record.key.id), &value)
            .await
    }
}

#[async_trait]
impl KeyStore for StorageKeyStore {
    async fn save(&self, key: &Key) -> Result<(), StorageError> {
        if key.id.is_empty() {
            return Err(StorageError::StorageError(
                "cannot persist a key without an id".to_owned(),
            ));
        }
        self.put(&KeyRecord::new(key.clone())).await
    }

    async fn retrieve(&self, id: &str) -> Result<KeyRecord, StorageError> {
        match self.storage.get(&Self::storage_key(id)).await? {
            Some(data) => deserialize(&data),
            None => Err(StorageError::NotFound),
        }
    }

    async fn revoke(&self, id: &str) -> Result<(), StorageError> {
        let mut record = match self.retrieve(id).await {
            Ok(record) => record,
            Err(StorageError::NotFound) => {
                debug!(key_id = %id, "revoking unknown key, nothing to do");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if record.is_revoked() {
            return Ok(());
        }

        record.revoke();
        self.put(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::KeyType;
    use crate::storage::MemoryStorage;

    fn api_key(id: &str) -> Key {
        let mut key = Key::new(KeyType::Api, "user@example.com").with_secret("signed-token");
        key.id = id.to_owned();
        key.issuer_id = "user@example.com".to_owned();
        key
    }

    #[tokio::test]
    async fn test_save_and_retrieve() {
        let store = StorageKeyStore::new(Arc::new(MemoryStorage::new()));

        store.save(&api_key("k1")).await.unwrap();

        let record = store.retrieve("k1").await.unwrap();
        assert_eq!(record.key.subject, "user@example.com");
        assert_eq!(record.key.key_type, KeyType::Api);
        assert!(record.key.secret.is_empty());
        assert!(!record.is_revoked());
    }

    #[tokio::test]
    async fn test_retrieve_missing_key() {
        let store = StorageKeyStore::new(Arc::new(MemoryStorage::new()));

        let result = store.retrieve("missing").await;
        assert!(matches!(result, Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let store = StorageKeyStore::new(Arc::new(MemoryStorage::new()));
        store.save(&api_key("k1")).await.unwrap();

        store.revoke("k1").await.unwrap();
        let first = store.retrieve("k1").await.unwrap().revoked_at;
        store.revoke("k1").await.unwrap();
        let second = store.retrieve("k1").await.unwrap().revoked_at;

        assert!(first.is_some());
        assert_eq!(first, second);

        store.revoke("never-issued").await.unwrap();
    }

    #[tokio::test]
    async fn test_save_requires_id() {
        let store = StorageKeyStore::new(Arc::new(MemoryStorage::new()));

        let result = store.save(&api_key("")).await;
        assert!(matches!(result, Err(StorageError::StorageError(_))));
    }
}
