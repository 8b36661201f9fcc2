//! RocksDB-backed state store.
//!
//! Two column families keyed by the 16 raw bytes of the document id:
//! - `snapshots`: LZ4-compressed [`StoredDocument`] blobs
//! - `manifests`: a small [`DocumentMetadata`] record per document
//!
//! Both are written in one `WriteBatch`, so a snapshot never exists
//! without its manifest. Listing walks `manifests` only.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{StateStore, StoreError, StoredDocument};
use crate::DocumentId;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_MANIFESTS: &str = "manifests";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Shared block cache for both column families, in bytes
    pub cache_bytes: usize,
    pub bloom_bits_per_key: f64,
    /// fsync every batch
    pub sync_writes: bool,
    pub max_open_files: i32,
    pub memtable_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            cache_bytes: 64 << 20,
            bloom_bits_per_key: 10.0,
            sync_writes: true,
            max_open_files: 512,
            memtable_bytes: 16 << 20,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            cache_bytes: 4 << 20,
            sync_writes: false,
            max_open_files: 64,
            memtable_bytes: 2 << 20,
            ..Self::at(path)
        }
    }
}

/// Bookkeeping kept next to each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: DocumentId,
    /// Sum of the stored version vector; grows with every save that
    /// carried new edits.
    pub version: u64,
    pub op_count: u64,
    pub tombstone_count: u64,
    pub raw_size: u64,
    pub stored_size: u64,
    pub saves: u64,
    /// Unix seconds
    pub first_saved: u64,
    pub last_saved: u64,
}

impl DocumentMetadata {
    fn describe(
        doc_id: DocumentId,
        doc: &StoredDocument,
        blob: &[u8],
        previous: Option<DocumentMetadata>,
    ) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let (saves, first_saved) = previous
            .map(|p| (p.saves, p.first_saved))
            .unwrap_or((0, now));
        Self {
            doc_id,
            version: doc.vector.total(),
            op_count: doc.state.op_count() as u64,
            tombstone_count: doc.state.tombstone_count() as u64,
            raw_size: prepended_size(blob),
            stored_size: blob.len() as u64,
            saves: saves + 1,
            first_saved,
            last_saved: now,
        }
    }

    /// Stored bytes per raw byte; below 1.0 means compression helped.
    pub fn compression_ratio(&self) -> f64 {
        if self.raw_size == 0 {
            return 1.0;
        }
        self.stored_size as f64 / self.raw_size as f64
    }
}

fn key(id: DocumentId) -> [u8; 16] {
    *id.as_bytes()
}

fn id_from_key(key: &[u8]) -> Result<DocumentId, StoreError> {
    <[u8; 16]>::try_from(key)
        .map(DocumentId::from_bytes)
        .map_err(|_| StoreError::Deserialization(format!("bad document key of {} bytes", key.len())))
}

/// Uncompressed length from the `compress_prepend_size` header.
fn prepended_size(blob: &[u8]) -> u64 {
    blob.get(..4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(|b| u32::from_le_bytes(b) as u64)
        .unwrap_or(0)
}

fn encode_meta(meta: &DocumentMetadata) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_meta(bytes: &[u8]) -> Result<DocumentMetadata, StoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(meta, _)| meta)
        .map_err(|e| StoreError::Deserialization(e.to_string()))
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    write_opts: WriteOptions,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(2);
        db_opts.increase_parallelism(threads);

        let cache = Cache::new_lru_cache(config.cache_bytes);
        let families = [
            // Blobs are LZ4 already; compressing again only costs CPU.
            (CF_SNAPSHOTS, DBCompressionType::None),
            (CF_MANIFESTS, DBCompressionType::Lz4),
        ]
        .into_iter()
        .map(|(name, compression)| {
            let mut table = BlockBasedOptions::default();
            table.set_block_cache(&cache);
            table.set_bloom_filter(config.bloom_bits_per_key, false);

            let mut opts = Options::default();
            opts.set_block_based_table_factory(&table);
            opts.set_write_buffer_size(config.memtable_bytes);
            opts.set_compression_type(compression);
            ColumnFamilyDescriptor::new(name, opts)
        });

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, families)?;
        log::info!("Opened state store at {}", config.path.display());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.sync_writes);
        Ok(Self { db, write_opts })
    }

    fn family(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    /// Write a snapshot and its manifest in one batch.
    pub fn save_snapshot(
        &self,
        id: DocumentId,
        doc: &StoredDocument,
    ) -> Result<DocumentMetadata, StoreError> {
        let blob = doc.encode()?;
        let meta = DocumentMetadata::describe(id, doc, &blob, self.load_metadata(id)?);

        let mut batch = WriteBatch::default();
        batch.put_cf(self.family(CF_SNAPSHOTS)?, key(id), &blob);
        batch.put_cf(self.family(CF_MANIFESTS)?, key(id), encode_meta(&meta)?);
        self.db.write_opt(batch, &self.write_opts)?;

        log::debug!(
            "Saved doc {id} (save #{}): {} ops, {} -> {} bytes",
            meta.saves,
            meta.op_count,
            meta.raw_size,
            meta.stored_size
        );
        Ok(meta)
    }

    pub fn load_snapshot(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        self.db
            .get_pinned_cf(self.family(CF_SNAPSHOTS)?, key(id))?
            .map(|blob| StoredDocument::decode(&blob))
            .transpose()
    }

    pub fn load_metadata(&self, id: DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        self.db
            .get_pinned_cf(self.family(CF_MANIFESTS)?, key(id))?
            .map(|bytes| decode_meta(&bytes))
            .transpose()
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        self.db
            .iterator_cf(self.family(CF_MANIFESTS)?, IteratorMode::Start)
            .map(|entry| id_from_key(&entry?.0))
            .collect()
    }

    /// Remove a document. Returns whether it existed.
    pub fn delete_document(&self, id: DocumentId) -> Result<bool, StoreError> {
        let manifests = self.family(CF_MANIFESTS)?;
        let existed = self.db.get_pinned_cf(manifests, key(id))?.is_some();
        if existed {
            let mut batch = WriteBatch::default();
            batch.delete_cf(self.family(CF_SNAPSHOTS)?, key(id));
            batch.delete_cf(manifests, key(id));
            self.db.write_opt(batch, &self.write_opts)?;
        }
        Ok(existed)
    }
}

impl StateStore for RocksStore {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        self.load_snapshot(id)
    }

    fn save(&self, id: DocumentId, doc: &StoredDocument) -> Result<(), StoreError> {
        self.save_snapshot(id, doc).map(|_| ())
    }

    fn delete(&self, id: DocumentId) -> Result<bool, StoreError> {
        self.delete_document(id)
    }

    fn list(&self) -> Result<Vec<DocumentId>, StoreError> {
        self.list_documents()
    }
}
