//! RocksDB-backed row store and local storage.
//!
//! Column families:
//! - `objects` — canvas rows, keyed `<canvas_id:16><object_id:16>`,
//!   value LZ4(bincode(CanvasObject))
//! - `local`   — client-private key-value entries (queue, snapshot),
//!   value LZ4(bytes)
//!
//! One database can serve as the shared row store for a relay host and as
//! the local storage of an embedded client at the same time.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use easel_core::{CanvasObject, ObjectId, VersionStamp};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use uuid::Uuid;

use super::{row_delete_wins, row_write_wins, LocalStorage, RowStore, StoreError};

const CF_OBJECTS: &str = "objects";
const CF_LOCAL: &str = "local";

const COLUMN_FAMILIES: &[&str] = &[CF_OBJECTS, CF_LOCAL];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("easel_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB store implementing both [`RowStore`] and [`LocalStorage`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-compare-write on rows.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened row store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OBJECTS => {
                // Rows are prefix-scanned by canvas id; values are already LZ4.
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_LOCAL => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_key(canvas_id: Uuid, id: ObjectId) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(canvas_id.as_bytes());
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn encode_row(object: &CanvasObject) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(object, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_row(bytes: &[u8]) -> Result<CanvasObject, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (object, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(object)
    }

    fn load_row(&self, canvas_id: Uuid, id: ObjectId) -> Result<Option<CanvasObject>, StoreError> {
        let cf = self.cf(CF_OBJECTS)?;
        match self.db.get_cf(cf, Self::row_key(canvas_id, id))? {
            Some(bytes) => Ok(Some(Self::decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_row(&self, canvas_id: Uuid, object: &CanvasObject) -> Result<(), StoreError> {
        let cf = self.cf(CF_OBJECTS)?;
        let value = Self::encode_row(object)?;
        self.db
            .put_cf_opt(cf, Self::row_key(canvas_id, object.id), value, &self.write_opts())?;
        Ok(())
    }
}

impl RowStore for RocksStore {
    fn fetch_all(&self, canvas_id: Uuid) -> Result<Vec<CanvasObject>, StoreError> {
        let cf = self.cf(CF_OBJECTS)?;
        let prefix = canvas_id.as_bytes();

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if key.len() != 32 || &key[..16] != prefix {
                break;
            }
            match Self::decode_row(&value) {
                Ok(row) => rows.push(row),
                Err(e) => log::warn!("Skipping unreadable row in canvas {canvas_id}: {e}"),
            }
        }

        Ok(rows)
    }

    fn upsert(&self, canvas_id: Uuid, object: &CanvasObject) -> Result<(), StoreError> {
        let _guard = self.guard();
        let existing = self.load_row(canvas_id, object.id)?;
        if row_write_wins(existing.as_ref(), object) {
            self.put_row(canvas_id, object)?;
        } else {
            log::debug!("Row {} kept newer stored version over v{}", object.id, object.version);
        }
        Ok(())
    }

    fn update(&self, canvas_id: Uuid, id: ObjectId, fields: &CanvasObject) -> Result<(), StoreError> {
        let _guard = self.guard();
        let existing = self
            .load_row(canvas_id, id)?
            .ok_or(StoreError::NotFound(id))?;
        if row_write_wins(Some(&existing), fields) {
            let mut row = fields.clone();
            row.id = id;
            self.put_row(canvas_id, &row)?;
        }
        Ok(())
    }

    fn delete(&self, canvas_id: Uuid, id: ObjectId, stamp: &VersionStamp) -> Result<(), StoreError> {
        let _guard = self.guard();
        let existing = self.load_row(canvas_id, id)?;
        if !row_delete_wins(existing.as_ref(), stamp) {
            log::debug!("Row {id} kept newer stored version over delete v{}", stamp.version);
            return Ok(());
        }
        let cf = self.cf(CF_OBJECTS)?;
        self.db
            .delete_cf_opt(cf, Self::row_key(canvas_id, id), &self.write_opts())?;
        Ok(())
    }
}

impl LocalStorage for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_LOCAL)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_LOCAL)?;
        let compressed = lz4_flex::compress_prepend_size(value);
        self.db
            .put_cf_opt(cf, key.as_bytes(), compressed, &self.write_opts())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_LOCAL)?;
        self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_opts())?;
        Ok(())
    }
}
