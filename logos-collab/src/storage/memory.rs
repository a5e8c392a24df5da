//! In-memory stores for tests, benchmarks and single-process deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use logos_core::{CanvasSettings, DocumentMetadata, DocumentState, Layer};

use super::{DocumentStateStore, SnapshotStore, StoreError};
use crate::versions::{Snapshot, Version};
use crate::DocumentId;

/// Current document rows kept in a concurrent map.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<DocumentId, DocumentState>,
    failing: AtomicBool,
    yielding: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a document.
    pub fn insert(&self, document_id: DocumentId, state: DocumentState) {
        self.documents.insert(document_id, state);
    }

    /// Mutate a document in place.
    pub fn update<R>(
        &self,
        document_id: DocumentId,
        f: impl FnOnce(&mut DocumentState) -> R,
    ) -> Result<R, StoreError> {
        let mut state = self
            .documents
            .get_mut(&document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        Ok(f(&mut state))
    }

    pub fn state(&self, document_id: DocumentId) -> Option<DocumentState> {
        self.documents.get(&document_id).map(|s| s.value().clone())
    }

    /// Make every subsequent call fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every call suspend once before touching the rows, the way a
    /// networked store would.
    pub fn set_yielding(&self, yielding: bool) {
        self.yielding.store(yielding, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected failure".into()));
        }
        Ok(())
    }

    async fn pause(&self) {
        if self.yielding.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl DocumentStateStore for MemoryDocumentStore {
    async fn read_full_state(&self, document_id: DocumentId) -> Result<DocumentState, StoreError> {
        self.check()?;
        self.pause().await;
        self.state(document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))
    }

    async fn write_layers(&self, document_id: DocumentId, layers: &[Layer]) -> Result<(), StoreError> {
        self.check()?;
        self.pause().await;
        self.update(document_id, |state| state.layers = layers.to_vec())
    }

    async fn write_metadata(
        &self,
        document_id: DocumentId,
        metadata: &DocumentMetadata,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.pause().await;
        self.update(document_id, |state| state.metadata = metadata.clone())
    }

    async fn write_canvas(&self, document_id: DocumentId, canvas: &CanvasSettings) -> Result<(), StoreError> {
        self.check()?;
        self.pause().await;
        self.update(document_id, |state| state.canvas = canvas.clone())
    }

    async fn upsert_layer(&self, document_id: DocumentId, layer: &Layer) -> Result<(), StoreError> {
        self.check()?;
        self.pause().await;
        self.update(document_id, |state| state.upsert_layer(layer.clone()))
    }

    async fn remove_layer(&self, document_id: DocumentId, layer_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.pause().await;
        self.update(document_id, |state| state.remove_layer(layer_id).is_some())
    }
}

/// Snapshots kept per document in version order.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: DashMap<DocumentId, BTreeMap<u64, Snapshot>>,
    failing: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots stored for a document.
    pub fn count(&self, document_id: DocumentId) -> usize {
        self.snapshots.get(&document_id).map_or(0, |v| v.len())
    }

    /// Make every subsequent call fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.check()?;
        let document_id = snapshot.version.document_id;
        let version = snapshot.version.version_number;

        let mut versions = self.snapshots.entry(document_id).or_default();
        if versions.contains_key(&version) {
            return Err(StoreError::VersionExists {
                document_id,
                version,
            });
        }
        versions.insert(version, snapshot.clone());
        Ok(())
    }

    async fn get(&self, document_id: DocumentId, version: u64) -> Result<Option<Snapshot>, StoreError> {
        self.check()?;
        Ok(self
            .snapshots
            .get(&document_id)
            .and_then(|versions| versions.get(&version).cloned()))
    }

    async fn latest(&self, document_id: DocumentId) -> Result<Option<Snapshot>, StoreError> {
        self.check()?;
        Ok(self
            .snapshots
            .get(&document_id)
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    async fn list(&self, document_id: DocumentId, limit: usize) -> Result<Vec<Version>, StoreError> {
        self.check()?;
        Ok(self
            .snapshots
            .get(&document_id)
            .map(|versions| {
                versions
                    .values()
                    .rev()
                    .take(limit)
                    .map(|s| s.version.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
