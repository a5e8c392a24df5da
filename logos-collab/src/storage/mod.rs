//! Persistence seams for the engine.
//!
//! Architecture:
//! ```text
//! ┌───────────────────┐  read_full_state   ┌────────────────────┐
//! │ VersionController │ ─────────────────► │ DocumentStateStore │  current rows
//! │                   │  write_* (rows)    │ (external CRUD)    │
//! │                   │ ─────────────────► └────────────────────┘
//! │                   │
//! │                   │  put / get / latest ┌────────────────────┐
//! │                   │ ──────────────────► │ SnapshotStore      │  append-only
//! └───────────────────┘                     │ memory | RocksDB   │
//!                                           └────────────────────┘
//! ```
//!
//! The two stores are independent: a snapshot is always retrievable by
//! `(document_id, version)` alone, regardless of what the current rows look
//! like.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use thiserror::Error;

use logos_core::{CanvasSettings, DocumentMetadata, DocumentState, Layer};

use crate::versions::{Snapshot, Version};
use crate::DocumentId;

pub use memory::{MemoryDocumentStore, MemorySnapshotStore};
pub use rocks::{RocksSnapshotStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("Version {version} not found for document {document_id}")]
    VersionNotFound { document_id: DocumentId, version: u64 },

    /// Insert-if-absent lost the race for this version number.
    #[error("Version {version} already exists for document {document_id}")]
    VersionExists { document_id: DocumentId, version: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Current (mutable) document rows: metadata, layers, canvas settings.
#[async_trait]
pub trait DocumentStateStore: Send + Sync {
    async fn read_full_state(&self, document_id: DocumentId) -> Result<DocumentState, StoreError>;

    /// Replace every layer of the document with `layers`, in order.
    async fn write_layers(&self, document_id: DocumentId, layers: &[Layer]) -> Result<(), StoreError>;

    /// Replace the metadata row. Canvas settings are left alone.
    async fn write_metadata(
        &self,
        document_id: DocumentId,
        metadata: &DocumentMetadata,
    ) -> Result<(), StoreError>;

    /// Replace the canvas settings row. Metadata is left alone.
    async fn write_canvas(&self, document_id: DocumentId, canvas: &CanvasSettings) -> Result<(), StoreError>;

    /// Insert or replace one layer row, keeping its position.
    async fn upsert_layer(&self, document_id: DocumentId, layer: &Layer) -> Result<(), StoreError>;

    /// Delete one layer row. Returns whether it existed.
    async fn remove_layer(&self, document_id: DocumentId, layer_id: &str) -> Result<bool, StoreError>;
}

/// Append-only snapshot persistence.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert-if-absent on `(document_id, version_number)`. Record and payload
    /// become visible together or not at all. A taken slot yields
    /// [`StoreError::VersionExists`].
    async fn put(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    async fn get(&self, document_id: DocumentId, version: u64) -> Result<Option<Snapshot>, StoreError>;

    /// The snapshot with the highest version number.
    async fn latest(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError>;

    /// Version records, newest first.
    async fn list(&self, document_id: DocumentId, limit: usize) -> Result<Vec<Version>, StoreError>;
}
