//! Engine error taxonomy.
//!
//! Contention and not-found cases are ordinary outcomes of concurrent
//! editing and are reported with enough detail for the client to retry or
//! resync. Only [`CollabError::Storage`] represents an unexpected failure.

use thiserror::Error;

use crate::storage::StoreError;
use crate::{ConnectionId, DocumentId, UserId};

pub type Result<T, E = CollabError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Layer '{layer_id}' is locked by {holder}")]
    LayerLocked { layer_id: String, holder: UserId },

    #[error("Layer '{layer_id}' is not locked by you")]
    NotLockHolder { layer_id: String },

    #[error("Could not assign a version for document {document_id} after {attempts} attempts")]
    VersionContention { document_id: DocumentId, attempts: u32 },

    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("Version {version} not found for document {document_id}")]
    VersionNotFound { document_id: DocumentId, version: u64 },

    #[error("No live session for connection {connection_id} on document {document_id}")]
    SessionNotFound {
        document_id: DocumentId,
        connection_id: ConnectionId,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(StoreError),
}

impl CollabError {
    /// Whether the caller may simply retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollabError::LayerLocked { .. }
                | CollabError::NotLockHolder { .. }
                | CollabError::VersionContention { .. }
        )
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::LayerLocked { .. } => "layer_locked",
            CollabError::NotLockHolder { .. } => "not_lock_holder",
            CollabError::VersionContention { .. } => "version_contention",
            CollabError::DocumentNotFound(_) => "document_not_found",
            CollabError::VersionNotFound { .. } => "version_not_found",
            CollabError::SessionNotFound { .. } => "session_not_found",
            CollabError::Protocol(_) => "protocol_error",
            CollabError::ShuttingDown => "shutting_down",
            CollabError::Storage(_) => "storage_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CollabError::DocumentNotFound(_)
                | CollabError::VersionNotFound { .. }
                | CollabError::SessionNotFound { .. }
        )
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DocumentNotFound(id) => CollabError::DocumentNotFound(id),
            StoreError::VersionNotFound { document_id, version } => {
                CollabError::VersionNotFound { document_id, version }
            }
            other => CollabError::Storage(other),
        }
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Protocol(e.to_string())
    }
}
