//! RocksDB-backed storage.
//!
//! Column families:
//! - `documents` — encoded document state per store id (LZ4 compressed)
//! - `metadata`  — per-record metadata (bincode: sizes, save count, timestamps)
//!
//! Blob and metadata are written in one atomic batch.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use super::StorageAdapter;
use crate::error::StorageError;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct RocksStorageConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for RocksStorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("orbit_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl RocksStorageConfig {
    /// Small caches, caller-supplied directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Metadata stored next to each record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Number of saves since the record was created
    pub save_count: u64,
    /// Uncompressed blob size in bytes
    pub size: u64,
    /// Compressed blob size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl StoreMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            save_count: 0,
            size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// RocksDB-backed storage adapter.
pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksStorageConfig,
    disposed: AtomicBool,
}

impl RocksStorage {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: RocksStorageConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("rocksdb storage opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            disposed: AtomicBool::new(false),
        })
    }

    fn cf_options(config: &RocksStorageConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        // Blobs are already LZ4-compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("missing column family {name}")))
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StorageError::Disposed);
        }
        Ok(())
    }

    /// Metadata of the record stored under `id`, if any.
    pub fn metadata(&self, id: &str) -> Result<Option<StoreMetadata>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(StoreMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for RocksStorage {
    async fn load(&self, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_open()?;
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StorageError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    async fn save(&self, id: &str, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_open()?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(data);
        let mut meta = self.metadata(id)?.unwrap_or_else(StoreMetadata::new);
        meta.save_count += 1;
        meta.size = data.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), StorageError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush()
    }
}
