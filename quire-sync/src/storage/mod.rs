//! Durable storage for document state.
//!
//! ```text
//! ┌──────────────┐  snapshot (S, V)  ┌───────────────────┐
//! │ DocumentRoom │ ────────────────► │ PersistenceBridge │  retry + backoff,
//! │ (in-memory)  │ ◄──────────────── │                   │  degraded signal
//! └──────────────┘   first attach    └─────────┬─────────┘
//!                                              │ spawn_blocking
//!                                              ▼
//!                                   ┌─────────────────────┐
//!                                   │ dyn StateStore      │
//!                                   │  ├─ MemoryStore     │
//!                                   │  └─ RocksStore      │
//!                                   └─────────────────────┘
//! ```
//!
//! Stored blobs are bincode-encoded [`StoredDocument`]s, LZ4 compressed.
//! Version history is written by the CRUD layer, not here.

pub mod bridge;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

use crate::crdt::{TextState, VersionVector};
use crate::DocumentId;

pub use bridge::{PersistenceBridge, PersistenceStatus, RetryPolicy};
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// The durable image of one document: its state and version vector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub state: TextState,
    pub vector: VersionVector,
}

impl StoredDocument {
    /// bincode, then LZ4 with the size prepended.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (doc, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(doc)
    }
}

/// Key-value storage of document state, keyed by document id.
///
/// Implementations are synchronous; the bridge runs them on the blocking
/// pool.
pub trait StateStore: Send + Sync + 'static {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError>;
    fn save(&self, id: DocumentId, doc: &StoredDocument) -> Result<(), StoreError>;
    fn delete(&self, id: DocumentId) -> Result<bool, StoreError>;
    fn list(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// In-process store for tests and single-node deployments without disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<DocumentId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("memory store lock poisoned".into())
}

impl StateStore for MemoryStore {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        blobs.get(&id).map(|b| StoredDocument::decode(b)).transpose()
    }

    fn save(&self, id: DocumentId, doc: &StoredDocument) -> Result<(), StoreError> {
        let encoded = doc.encode()?;
        self.blobs.write().map_err(poisoned)?.insert(id, encoded);
        Ok(())
    }

    fn delete(&self, id: DocumentId) -> Result<bool, StoreError> {
        Ok(self.blobs.write().map_err(poisoned)?.remove(&id).is_some())
    }

    fn list(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self.blobs.read().map_err(poisoned)?.keys().copied().collect())
    }
}
