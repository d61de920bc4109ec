//! File-per-record storage.
//!
//! Each id maps to `<root>/<hex(id)>.orbit`, holding the LZ4-compressed
//! blob. Each write goes to its own uniquely named `.tmp` sibling and is
//! renamed into place, so a crash or an overlapping save never leaves a
//! half-written record behind.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::StorageAdapter;
use crate::error::StorageError;

const RECORD_EXTENSION: &str = "orbit";

pub struct FileStorage {
    root: PathBuf,
    disposed: AtomicBool,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        log::debug!("file storage opened at {}", root.display());
        Ok(Self {
            root,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record for `id`. Ids are hex-encoded so any string is a
    /// valid, collision-free file name.
    pub fn record_path(&self, id: &str) -> PathBuf {
        let name: String = id.bytes().map(|b| format!("{b:02x}")).collect();
        self.root.join(format!("{name}.{RECORD_EXTENSION}"))
    }

    fn ensure_open(&self, id: &str) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StorageError::Disposed);
        }
        if id.is_empty() {
            return Err(StorageError::InvalidId(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_open(id)?;
        let compressed = match tokio::fs::read(self.record_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        Ok(Some(data))
    }

    async fn save(&self, id: &str, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_open(id)?;
        let path = self.record_path(id);
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let compressed = lz4_flex::compress_prepend_size(data);

        let written = match tokio::fs::write(&temp_path, &compressed).await {
            Ok(()) => tokio::fs::rename(&temp_path, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        log::trace!("saved {id}: {} bytes ({} on disk)", data.len(), compressed.len());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.ensure_open(id)?;
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn dispose(&self) -> Result<(), StorageError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
