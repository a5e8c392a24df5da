//! Version controller: snapshot creation, diff and restore.
//!
//! ```text
//!   create_snapshot                      restore(n)
//!        │                                   │
//!        ▼                                   ▼
//!  read_full_state ─┐              get(n) ── must exist first
//!  latest()         │                        │
//!  next = latest+1  │ retry on               ▼
//!  diff vs latest   │ VersionExists   write_layers (replace all)
//!  put (if absent) ─┘                 write_metadata, write_canvas
//!                                            │
//!                                            ▼
//!                                   create Restore version (n+k)
//! ```
//!
//! Version numbers start at 1 and are claimed optimistically: the snapshot
//! store's `put` is insert-if-absent, so two writers racing for the same
//! number cannot both win, and the loser re-reads and tries the next one.
//! Nothing is held across an `.await`.

mod diff;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use logos_core::DocumentState;

use crate::config::VersionConfig;
use crate::error::{CollabError, Result};
use crate::storage::{DocumentStateStore, SnapshotStore, StoreError};
use crate::{unix_millis, DocumentId, UserId};

pub use diff::{FieldChange, LayerChanges, LayerModification, VersionDiff};

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Manual,
    AutoSave,
    Restore,
}

/// Version record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub document_id: DocumentId,
    pub version_number: u64,
    /// Unix milliseconds.
    pub created_at: u64,
    pub created_by: UserId,
    pub message: Option<String>,
    pub kind: SnapshotKind,
    /// Source version for [`SnapshotKind::Restore`] versions.
    pub restored_from: Option<u64>,
}

/// Version record plus the full document state it captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: Version,
    pub state: DocumentState,
    /// Informational diff against the preceding version; `None` for version 1.
    pub diff_from_previous: Option<VersionDiff>,
}

/// Result of a restore: the state now current and the version recording it.
#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub state: DocumentState,
    pub version: Version,
}

pub struct VersionController {
    documents: Arc<dyn DocumentStateStore>,
    snapshots: Arc<dyn SnapshotStore>,
    config: VersionConfig,
}

impl VersionController {
    pub fn new(
        documents: Arc<dyn DocumentStateStore>,
        snapshots: Arc<dyn SnapshotStore>,
        config: VersionConfig,
    ) -> Self {
        Self {
            documents,
            snapshots,
            config,
        }
    }

    /// Snapshot the current document state as a manual checkpoint.
    pub async fn create_snapshot(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        message: Option<String>,
    ) -> Result<Version> {
        let state = self.documents.read_full_state(document_id).await?;
        self.commit(document_id, user_id, state, message, SnapshotKind::Manual, None)
            .await
    }

    /// Snapshot an already-read state on behalf of the auto-saver.
    pub(crate) async fn create_auto_save(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        state: DocumentState,
    ) -> Result<Version> {
        self.commit(document_id, user_id, state, None, SnapshotKind::AutoSave, None)
            .await
    }

    /// Make version `version` the current state and record that as a new version.
    ///
    /// The requested snapshot is loaded and decoded before anything is
    /// written, so an unknown or unreadable version leaves the document
    /// untouched.
    pub async fn restore(
        &self,
        document_id: DocumentId,
        version: u64,
        user_id: UserId,
    ) -> Result<Restored> {
        let source = self.get_version(document_id, version).await?;

        self.documents
            .write_layers(document_id, &source.state.layers)
            .await?;
        self.documents
            .write_metadata(document_id, &source.state.metadata)
            .await?;
        self.documents
            .write_canvas(document_id, &source.state.canvas)
            .await?;

        let state = self.documents.read_full_state(document_id).await?;
        let message = Some(format!("Restored from version {version}"));
        let created = self
            .commit(
                document_id,
                user_id,
                state.clone(),
                message,
                SnapshotKind::Restore,
                Some(version),
            )
            .await?;

        log::info!(
            "Restored document {document_id} to version {version} as version {}",
            created.version_number
        );
        Ok(Restored {
            state,
            version: created,
        })
    }

    /// Compare two stored versions.
    pub async fn diff(&self, document_id: DocumentId, v1: u64, v2: u64) -> Result<VersionDiff> {
        let from = self.get_version(document_id, v1).await?;
        let to = if v1 == v2 {
            from.clone()
        } else {
            self.get_version(document_id, v2).await?
        };
        Ok(VersionDiff::between(v1, &from.state, v2, &to.state))
    }

    /// Version records, newest first.
    pub async fn list_versions(
        &self,
        document_id: DocumentId,
        limit: Option<usize>,
    ) -> Result<Vec<Version>> {
        let limit = limit.unwrap_or(self.config.default_list_limit);
        let versions = self.snapshots.list(document_id, limit).await?;
        if versions.is_empty() {
            self.ensure_document(document_id).await?;
        }
        Ok(versions)
    }

    /// A stored snapshot. Unknown documents yield `DocumentNotFound`, known
    /// documents without that version yield `VersionNotFound`.
    pub async fn get_version(&self, document_id: DocumentId, version: u64) -> Result<Snapshot> {
        match self.snapshots.get(document_id, version).await? {
            Some(snapshot) => Ok(snapshot),
            None => {
                self.ensure_document(document_id).await?;
                Err(CollabError::VersionNotFound {
                    document_id,
                    version,
                })
            }
        }
    }

    async fn ensure_document(&self, document_id: DocumentId) -> Result<()> {
        self.documents.read_full_state(document_id).await?;
        Ok(())
    }

    pub async fn latest_snapshot(&self, document_id: DocumentId) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.latest(document_id).await?)
    }

    pub async fn current_state(&self, document_id: DocumentId) -> Result<DocumentState> {
        Ok(self.documents.read_full_state(document_id).await?)
    }

    async fn commit(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        state: DocumentState,
        message: Option<String>,
        kind: SnapshotKind,
        restored_from: Option<u64>,
    ) -> Result<Version> {
        let attempts = self.config.max_assign_attempts.max(1);

        for attempt in 1..=attempts {
            let previous = self.snapshots.latest(document_id).await?;
            let version_number = previous
                .as_ref()
                .map_or(1, |p| p.version.version_number + 1);
            let diff_from_previous = previous.as_ref().map(|p| {
                VersionDiff::between(p.version.version_number, &p.state, version_number, &state)
            });

            let snapshot = Snapshot {
                version: Version {
                    document_id,
                    version_number,
                    created_at: unix_millis(),
                    created_by: user_id,
                    message: message.clone(),
                    kind,
                    restored_from,
                },
                state: state.clone(),
                diff_from_previous,
            };

            match self.snapshots.put(&snapshot).await {
                Ok(()) => {
                    log::info!(
                        "Created {kind:?} version {version_number} of document {document_id}"
                    );
                    return Ok(snapshot.version);
                }
                Err(StoreError::VersionExists { .. }) => {
                    log::debug!(
                        "Version {version_number} of document {document_id} taken (attempt {attempt}/{attempts}), retrying"
                    );
                }
                Err(e) => {
                    log::error!("Failed to store snapshot for document {document_id}: {e}");
                    return Err(e.into());
                }
            }
        }

        Err(CollabError::VersionContention {
            document_id,
            attempts,
        })
    }
}
