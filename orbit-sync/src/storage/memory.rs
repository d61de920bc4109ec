use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::StorageAdapter;
use crate::error::StorageError;

/// In-memory storage. Clones share the same records, so several
/// coordinators in one process can use one store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    records: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    saves: Arc<AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls across all clones.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn save(&self, id: &str, data: &[u8]) -> Result<(), StorageError> {
        self.records.lock().await.insert(id.to_string(), data.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    // Records outlive a single coordinator on purpose; other clones may
    // still be in use.
    async fn dispose(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_delete() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load("a").await.unwrap(), None);

        storage.save("a", b"first").await.unwrap();
        storage.save("a", b"second").await.unwrap();
        assert_eq!(storage.load("a").await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(storage.save_count(), 2);

        storage.delete("a").await.unwrap();
        assert_eq!(storage.load("a").await.unwrap(), None);
        storage.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage.save("k", b"v").await.unwrap();
        assert_eq!(other.load("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(other.contains("k").await);
        assert_eq!(other.save_count(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_partitioned() {
        let storage = MemoryStorage::new();
        storage.save("x", b"1").await.unwrap();
        storage.save("y", b"2").await.unwrap();
        assert_eq!(storage.load("x").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.len().await, 2);
    }
}
