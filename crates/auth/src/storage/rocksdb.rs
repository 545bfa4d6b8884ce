use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, DB};

use super::{Storage, StorageError};

/// RocksDB storage implementation
pub struct RocksDBStorage {
    db: DB,
}

impl fmt::Debug for RocksDBStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksDBStorage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksDBStorage {
    /// Open (or create) a RocksDB database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = DB::open_default(path)
            .map_err(|e| StorageError::StorageError(format!("Failed to open RocksDB: {e}")))?;

        Ok(Self { db })
    }
}

#[async_trait]
impl Storage for RocksDBStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key.as_bytes())
            .map_err(|e| StorageError::StorageError(format!("Failed to get key: {e}")))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| StorageError::StorageError(format!("Failed to set key: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| StorageError::StorageError(format!("Failed to delete key: {e}")))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.db
            .get_pinned(key.as_bytes())
            .map(|v| v.is_some())
            .map_err(|e| StorageError::StorageError(format!("Failed to check key existence: {e}")))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| {
                StorageError::StorageError(format!("Failed to iterate over keys: {e}"))
            })?;

            let key = String::from_utf8_lossy(&key).into_owned();

            // Keys are sorted, so the first key outside the prefix ends the scan
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn setup_db() -> (RocksDBStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = RocksDBStorage::new(dir.path()).unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let (db, _dir) = setup_db();

        assert!(db.get("key:1").await.unwrap().is_none());
        assert!(!db.exists("key:1").await.unwrap());

        db.set("key:1", b"value").await.unwrap();
        assert_eq!(db.get("key:1").await.unwrap(), Some(b"value".to_vec()));
        assert!(db.exists("key:1").await.unwrap());

        db.delete("key:1").await.unwrap();
        assert!(db.get("key:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_keys() {
        let (db, _dir) = setup_db();

        for key in ["key:1", "key:2", "key:3", "other:1", "kez:1"] {
            db.set(key, b"value").await.unwrap();
        }

        let keys = db.list_keys("key:").await.unwrap();
        assert_eq!(keys, vec!["key:1", "key:2", "key:3"]);
    }
}
