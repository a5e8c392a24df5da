//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `versions`  — Version records (bincode, keyed by doc_id:version)
//! - `snapshots` — Full document state + informational diff (JSON, LZ4 compressed, same key)
//! - `heads`     — Latest version number per document (keyed by doc_id)
//!
//! A put writes all three in one `WriteBatch`, so a record is never visible
//! without its payload. Each snapshot is self-contained: loading version `n`
//! never touches any other version.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use logos_core::DocumentState;

use super::{SnapshotStore, StoreError};
use crate::versions::{Snapshot, Version, VersionDiff};
use crate::DocumentId;

/// Column family names.
const CF_VERSIONS: &str = "versions";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_HEADS: &str = "heads";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_VERSIONS, CF_SNAPSHOTS, CF_HEADS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true, snapshots are rare and must survive)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// What goes into the `snapshots` column family.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    state: DocumentState,
    diff_from_previous: Option<VersionDiff>,
}

/// RocksDB-backed [`SnapshotStore`].
pub struct RocksSnapshotStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the existence check and batch write of `put`.
    write_lock: Mutex<()>,
}

impl RocksSnapshotStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                // Payloads are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_VERSIONS => {
                // Small records, range-scanned newest first per document
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            CF_HEADS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)) as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Latest version number recorded for a document.
    pub fn head(&self, document_id: DocumentId) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_HEADS)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_sync(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_heads = self.cf(CF_HEADS)?;

        let document_id = snapshot.version.document_id;
        let version = snapshot.version.version_number;
        let key = Self::version_key(document_id, version);

        // Encode before taking the lock
        let record = encode_version(&snapshot.version)?;
        let payload = serde_json::to_vec(&SnapshotPayload {
            state: snapshot.state.clone(),
            diff_from_previous: snapshot.diff_from_previous.clone(),
        })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&payload);

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.db.get_cf(cf_versions, &key)?.is_some() {
            return Err(StoreError::VersionExists {
                document_id,
                version,
            });
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_versions, &key, &record);
        batch.put_cf(cf_snapshots, &key, &compressed);
        if self.head(document_id)?.map_or(true, |head| version > head) {
            batch.put_cf(cf_heads, document_id.as_bytes(), version.to_be_bytes());
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Stored snapshot {document_id}:{version} ({} → {} bytes)",
            payload.len(),
            compressed.len()
        );
        Ok(())
    }

    fn get_sync(&self, document_id: DocumentId, version: u64) -> Result<Option<Snapshot>, StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let key = Self::version_key(document_id, version);

        let record = match self.db.get_cf(cf_versions, &key)? {
            Some(bytes) => decode_version(&bytes)?,
            None => return Ok(None),
        };
        let compressed = self.db.get_cf(cf_snapshots, &key)?.ok_or_else(|| {
            StoreError::Database(format!(
                "Snapshot payload missing for {document_id}:{version}"
            ))
        })?;

        let payload = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let payload: SnapshotPayload = serde_json::from_slice(&payload)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        Ok(Some(Snapshot {
            version: record,
            state: payload.state,
            diff_from_previous: payload.diff_from_previous,
        }))
    }

    fn list_sync(&self, document_id: DocumentId, limit: usize) -> Result<Vec<Version>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let start_key = Self::version_key(document_id, u64::MAX);

        let mut versions = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Reverse));

        for item in iter {
            if versions.len() >= limit {
                break;
            }
            let (key, value) = item?;
            // Stop once we've left this document's key prefix
            if key.len() != 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            versions.push(decode_version(&value)?);
        }

        Ok(versions)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Build a version key: doc_id (16 bytes) + version (8 bytes big-endian).
    fn version_key(document_id: DocumentId, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(document_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

#[async_trait]
impl SnapshotStore for RocksSnapshotStore {
    async fn put(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.put_sync(snapshot)
    }

    async fn get(&self, document_id: DocumentId, version: u64) -> Result<Option<Snapshot>, StoreError> {
        self.get_sync(document_id, version)
    }

    async fn latest(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError> {
        match self.head(document_id)? {
            Some(version) => self.get_sync(document_id, version),
            None => Ok(None),
        }
    }

    async fn list(&self, document_id: DocumentId, limit: usize) -> Result<Vec<Version>, StoreError> {
        self.list_sync(document_id, limit)
    }
}

fn encode_version(version: &Version) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(version, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_version(bytes: &[u8]) -> Result<Version, StoreError> {
    let (version, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(version)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization("Invalid head value".into()))?;
    Ok(u64::from_be_bytes(buf))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
