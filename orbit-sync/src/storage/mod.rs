//! Durable key → blob storage for encoded document state.
//!
//! ```text
//! Coordinator ── save(store_id, full_state) ──► StorageAdapter
//!             ◄─ load(store_id) ───────────────┤
//!                                              ├── MemoryStorage  (process-local)
//!                                              ├── FileStorage    (one file per id)
//!                                              └── RocksStorage   (feature "rocksdb")
//! ```
//!
//! A record is always the complete encoded state; a successful `save`
//! fully supersedes the previous blob, and `load` returns exactly the
//! bytes that were saved.

use async_trait::async_trait;

use crate::error::StorageError;

pub mod file;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use file::FileStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStorage, RocksStorageConfig, StoreMetadata};

/// Abstract durable store. `id` is an opaque partition key.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Most recently saved blob, or `None` if nothing was saved.
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the blob stored under `id`.
    async fn save(&self, id: &str, data: &[u8]) -> Result<(), StorageError>;

    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Release resources. Later calls may fail with `StorageError::Disposed`.
    async fn dispose(&self) -> Result<(), StorageError>;
}
