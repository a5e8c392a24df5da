//! Session coordinator: binds connections to the collaboration core.
//!
//! Every inbound [`ClientEvent`] is translated into calls on the presence
//! registry, lock manager, update log, version controller and auto-save
//! scheduler. Replies go back to the calling connection; everything other
//! connections on the document should see is published through the
//! [`Notifier`].
//!
//! ```text
//! edit(layer) ──► session live? ──► lock held by caller? ──► apply to state store
//!                                                               │
//!          publish `edited` ◄── schedule auto-save ◄── append to update log
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use logos_core::{CanvasSettings, DocumentMetadata, Layer};

use crate::autosave::{AutoSaveScheduler, ShutdownReport};
use crate::broadcast::{Notification, Notifier};
use crate::config::CollabConfig;
use crate::error::{CollabError, Result};
use crate::locks::{LayerLock, LockManager};
use crate::presence::{DepartureListener, PresenceRegistry, Session, SessionHandle};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::storage::{DocumentStateStore, SnapshotStore};
use crate::update_log::{CatchUp, UpdateEvent, UpdateLog};
use crate::versions::{Restored, Version, VersionController, VersionDiff};
use crate::{ConnectionId, DocumentId, UserId};

/// Replace a layer; payload is the full layer.
pub const ACTION_LAYER_UPDATE: &str = "layer.update";
/// Remove a layer; payload ignored.
pub const ACTION_LAYER_REMOVE: &str = "layer.remove";
/// Replace document metadata; payload is the metadata.
pub const ACTION_METADATA_UPDATE: &str = "metadata.update";
/// Replace canvas settings; payload is the settings.
pub const ACTION_CANVAS_UPDATE: &str = "canvas.update";
/// Logged when a version is restored.
pub const ACTION_VERSION_RESTORED: &str = "version.restored";

/// Per-connection state owned by the transport.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub connection_id: ConnectionId,
    /// Set after a successful `join`.
    pub session: Option<SessionHandle>,
}

impl ConnectionState {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            session: None,
        }
    }
}

/// Announces ended sessions and releases a departed user's locks.
struct DepartureHandler {
    locks: Arc<LockManager>,
    notifier: Arc<dyn Notifier>,
}

impl DepartureListener for DepartureHandler {
    fn session_ended(&self, session: &Session) {
        self.notifier.publish(
            session.document_id,
            Notification::from_connection(
                session.connection_id,
                ServerEvent::UserLeft {
                    user_id: session.user_id,
                    connection_id: session.connection_id,
                },
            ),
        );
    }

    fn user_departed(&self, document_id: DocumentId, user_id: UserId) {
        let released = self.locks.release_all_for(document_id, user_id);
        for lock in released {
            self.notifier.publish(
                document_id,
                Notification::from_server(ServerEvent::LayerUnlocked {
                    layer_id: lock.layer_id,
                    user_id,
                }),
            );
        }
    }
}

pub struct SessionCoordinator {
    presence: PresenceRegistry,
    locks: Arc<LockManager>,
    log: UpdateLog,
    versions: Arc<VersionController>,
    autosave: AutoSaveScheduler,
    documents: Arc<dyn DocumentStateStore>,
    notifier: Arc<dyn Notifier>,
    closed: AtomicBool,
}

impl SessionCoordinator {
    pub fn new(
        config: CollabConfig,
        documents: Arc<dyn DocumentStateStore>,
        snapshots: Arc<dyn SnapshotStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let locks = Arc::new(LockManager::new(config.locks));
        let departures = Arc::new(DepartureHandler {
            locks: locks.clone(),
            notifier: notifier.clone(),
        });
        let versions = Arc::new(VersionController::new(
            documents.clone(),
            snapshots,
            config.versions,
        ));

        Self {
            presence: PresenceRegistry::new(config.presence, departures),
            locks,
            log: UpdateLog::new(config.update_log),
            autosave: AutoSaveScheduler::new(versions.clone(), config.auto_save),
            versions,
            documents,
            notifier,
            closed: AtomicBool::new(false),
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn update_log(&self) -> &UpdateLog {
        &self.log
    }

    pub fn versions(&self) -> &VersionController {
        &self.versions
    }

    pub fn autosave(&self) -> &AutoSaveScheduler {
        &self.autosave
    }

    // ─── Presence ───────────────────────────────────────────

    /// Register a connection on an existing document.
    pub async fn join(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Result<SessionHandle> {
        self.ensure_open()?;
        // Fails with DocumentNotFound for unknown documents.
        self.documents.read_full_state(document_id).await?;

        // Locks of users whose sessions expired must not outlive them.
        self.presence.purge_expired();
        let handle = self.presence.join(document_id, user_id, connection_id);
        self.notifier.publish(
            document_id,
            Notification::from_connection(
                connection_id,
                ServerEvent::UserJoined {
                    user_id,
                    connection_id,
                },
            ),
        );
        Ok(handle)
    }

    /// End a session. Locks are released once the user's last session on
    /// the document is gone. Idempotent.
    pub fn leave(&self, handle: &SessionHandle) -> Option<Session> {
        self.presence.leave(handle.document_id, handle.connection_id)
    }

    pub fn heartbeat(&self, handle: &SessionHandle) -> Result<()> {
        self.presence
            .heartbeat(handle.document_id, handle.connection_id)
    }

    // ─── Locks ──────────────────────────────────────────────

    pub fn lock(&self, handle: &SessionHandle, layer_id: &str) -> Result<LayerLock> {
        self.presence.purge_expired();
        self.ensure_live(handle)?;
        let lock = self
            .locks
            .acquire(handle.document_id, layer_id, handle.user_id)?;
        self.notifier.publish(
            handle.document_id,
            Notification::from_connection(handle.connection_id, Self::locked_event(&lock)),
        );
        Ok(lock)
    }

    /// Release a lock held by the caller. Not holding it is a no-op.
    pub fn unlock(&self, handle: &SessionHandle, layer_id: &str) -> Option<LayerLock> {
        let released = self
            .locks
            .unlock(handle.document_id, layer_id, handle.user_id)?;
        self.notifier.publish(
            handle.document_id,
            Notification::from_connection(
                handle.connection_id,
                ServerEvent::LayerUnlocked {
                    layer_id: released.layer_id.clone(),
                    user_id: handle.user_id,
                },
            ),
        );
        Some(released)
    }

    // ─── Edits ──────────────────────────────────────────────

    /// Apply an edit, record it and schedule an auto-save.
    ///
    /// An edit naming a layer requires the caller to hold that layer's lock.
    pub async fn edit(
        &self,
        handle: &SessionHandle,
        layer_id: Option<&str>,
        action: &str,
        payload: Value,
    ) -> Result<UpdateEvent> {
        self.ensure_open()?;
        self.presence.purge_expired();
        self.ensure_live(handle)?;
        let document_id = handle.document_id;

        if let Some(layer_id) = layer_id {
            match self.locks.lock(document_id, layer_id) {
                Some(lock) if lock.holder == handle.user_id => {}
                Some(lock) => {
                    return Err(CollabError::LayerLocked {
                        layer_id: layer_id.to_string(),
                        holder: lock.holder,
                    })
                }
                None => {
                    return Err(CollabError::NotLockHolder {
                        layer_id: layer_id.to_string(),
                    })
                }
            }
        }

        self.apply_edit(document_id, layer_id, action, &payload).await?;

        if let Some(layer_id) = layer_id {
            if !self.locks.refresh(document_id, layer_id, handle.user_id) {
                log::warn!(
                    "Lock on layer {layer_id} of document {document_id} lapsed while user {} was editing it",
                    handle.user_id
                );
            }
        }
        let event = self.log.append(document_id, handle.user_id, action, payload);
        self.autosave.schedule(document_id, handle.user_id);
        self.notifier.publish(
            document_id,
            Notification::from_connection(
                handle.connection_id,
                ServerEvent::Edited {
                    event: event.clone(),
                },
            ),
        );
        Ok(event)
    }

    async fn apply_edit(
        &self,
        document_id: DocumentId,
        layer_id: Option<&str>,
        action: &str,
        payload: &Value,
    ) -> Result<()> {
        match action {
            ACTION_LAYER_UPDATE => {
                let layer_id = Self::require_layer(layer_id, action)?;
                let layer: Layer = serde_json::from_value(payload.clone())?;
                if layer.id != layer_id {
                    return Err(CollabError::Protocol(format!(
                        "payload layer '{}' does not match '{layer_id}'",
                        layer.id
                    )));
                }
                self.documents.upsert_layer(document_id, &layer).await?;
            }
            ACTION_LAYER_REMOVE => {
                let layer_id = Self::require_layer(layer_id, action)?;
                self.documents.remove_layer(document_id, layer_id).await?;
            }
            ACTION_METADATA_UPDATE => {
                let metadata: DocumentMetadata = serde_json::from_value(payload.clone())?;
                self.documents.write_metadata(document_id, &metadata).await?;
            }
            ACTION_CANVAS_UPDATE => {
                let canvas: CanvasSettings = serde_json::from_value(payload.clone())?;
                self.documents.write_canvas(document_id, &canvas).await?;
            }
            // Anything else is recorded and relayed as-is.
            _ => {}
        }
        Ok(())
    }

    fn require_layer<'a>(layer_id: Option<&'a str>, action: &str) -> Result<&'a str> {
        layer_id.ok_or_else(|| CollabError::Protocol(format!("{action} requires a layerId")))
    }

    /// Events after a sequence number, after a timestamp, or everything
    /// retained, in that order of preference.
    pub fn catch_up(
        &self,
        document_id: DocumentId,
        since_timestamp: Option<u64>,
        since_sequence: Option<u64>,
    ) -> CatchUp {
        match (since_sequence, since_timestamp) {
            (Some(sequence), _) => self.log.recent_since_sequence(document_id, sequence),
            (None, Some(timestamp)) => self.log.recent_since(document_id, timestamp),
            (None, None) => self.log.recent_since_sequence(document_id, 0),
        }
    }

    // ─── Versions ───────────────────────────────────────────

    pub async fn create_version(
        &self,
        handle: &SessionHandle,
        message: Option<String>,
    ) -> Result<Version> {
        let version = self
            .versions
            .create_snapshot(handle.document_id, handle.user_id, message)
            .await?;
        self.notifier.publish(
            handle.document_id,
            Notification::from_connection(
                handle.connection_id,
                ServerEvent::VersionCreated {
                    version: version.clone(),
                },
            ),
        );
        Ok(version)
    }

    pub async fn list_versions(
        &self,
        document_id: DocumentId,
        limit: Option<usize>,
    ) -> Result<Vec<Version>> {
        self.versions.list_versions(document_id, limit).await
    }

    pub async fn restore_version(&self, handle: &SessionHandle, version: u64) -> Result<Restored> {
        let restored = self
            .versions
            .restore(handle.document_id, version, handle.user_id)
            .await?;

        self.log.append(
            handle.document_id,
            handle.user_id,
            ACTION_VERSION_RESTORED,
            json!({
                "restoredFrom": version,
                "version": restored.version.version_number,
            }),
        );
        self.notifier.publish(
            handle.document_id,
            Notification::from_connection(
                handle.connection_id,
                ServerEvent::VersionRestored {
                    version: restored.version.clone(),
                    state: restored.state.clone(),
                },
            ),
        );
        Ok(restored)
    }

    pub async fn compare_versions(
        &self,
        document_id: DocumentId,
        v1: u64,
        v2: u64,
    ) -> Result<VersionDiff> {
        self.versions.diff(document_id, v1, v2).await
    }

    // ─── Dispatch ───────────────────────────────────────────

    /// Handle one client event and return the replies for its connection.
    /// Failures become `error` replies; nothing here ends the connection.
    pub async fn handle(&self, connection: &mut ConnectionState, event: ClientEvent) -> Vec<ServerEvent> {
        match self.dispatch(connection, event).await {
            Ok(replies) => replies,
            Err(e) => {
                match &e {
                    CollabError::Storage(_) => log::error!(
                        "Request from connection {} failed: {e}",
                        connection.connection_id
                    ),
                    _ => log::debug!(
                        "Request from connection {} rejected: {e}",
                        connection.connection_id
                    ),
                }
                vec![ServerEvent::from(&e)]
            }
        }
    }

    async fn dispatch(&self, connection: &mut ConnectionState, event: ClientEvent) -> Result<Vec<ServerEvent>> {
        let handle = match event {
            ClientEvent::Ping => return Ok(vec![ServerEvent::Pong]),
            ClientEvent::Join {
                document_id,
                user_id,
            } => return self.handle_join(connection, document_id, user_id).await,
            _ => connection
                .session
                .ok_or_else(|| CollabError::Protocol("join a document first".into()))?,
        };

        let replies = match event {
            ClientEvent::Join { .. } | ClientEvent::Ping => Vec::new(),
            ClientEvent::Leave => {
                self.leave(&handle);
                connection.session = None;
                vec![ServerEvent::Left]
            }
            ClientEvent::Heartbeat => {
                self.heartbeat(&handle)?;
                Vec::new()
            }
            ClientEvent::Edit {
                layer_id,
                action,
                payload,
            } => {
                let event = self
                    .edit(&handle, layer_id.as_deref(), &action, payload)
                    .await?;
                vec![ServerEvent::Edited { event }]
            }
            ClientEvent::Lock { layer_id } => match self.lock(&handle, &layer_id) {
                Ok(lock) => vec![Self::locked_event(&lock)],
                Err(CollabError::LayerLocked { layer_id, holder }) => {
                    vec![ServerEvent::LockRejected { layer_id, holder }]
                }
                Err(e) => return Err(e),
            },
            ClientEvent::Unlock { layer_id } => match self.unlock(&handle, &layer_id) {
                Some(released) => vec![ServerEvent::LayerUnlocked {
                    layer_id: released.layer_id,
                    user_id: handle.user_id,
                }],
                None => Vec::new(),
            },
            ClientEvent::CatchUp {
                since_timestamp,
                since_sequence,
            } => vec![self
                .catch_up(handle.document_id, since_timestamp, since_sequence)
                .into()],
            ClientEvent::CreateVersion { message } => {
                let version = self.create_version(&handle, message).await?;
                vec![ServerEvent::VersionCreated { version }]
            }
            ClientEvent::ListVersions { limit } => {
                let versions = self.list_versions(handle.document_id, limit).await?;
                vec![ServerEvent::Versions { versions }]
            }
            ClientEvent::RestoreVersion { version } => {
                let restored = self.restore_version(&handle, version).await?;
                vec![ServerEvent::VersionRestored {
                    version: restored.version,
                    state: restored.state,
                }]
            }
            ClientEvent::CompareVersions { v1, v2 } => {
                let diff = self.compare_versions(handle.document_id, v1, v2).await?;
                vec![ServerEvent::VersionDiff { diff }]
            }
        };
        Ok(replies)
    }

    async fn handle_join(
        &self,
        connection: &mut ConnectionState,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Vec<ServerEvent>> {
        // A connection is bound to one document and user at a time.
        if let Some(previous) = connection.session {
            if previous.document_id != document_id || previous.user_id != user_id {
                self.leave(&previous);
                connection.session = None;
            }
        }

        let handle = self
            .join(document_id, user_id, connection.connection_id)
            .await?;
        connection.session = Some(handle);

        let session = self
            .presence
            .session(document_id, connection.connection_id)
            .ok_or(CollabError::SessionNotFound {
                document_id,
                connection_id: connection.connection_id,
            })?;
        Ok(vec![ServerEvent::Joined {
            session,
            active_users: self.presence.list_active(document_id),
            locks: self.locks.locks_for(document_id),
            latest_sequence: self.log.latest_sequence(document_id),
        }])
    }

    /// Leave the connection's session, if any. Called when a socket closes.
    pub fn disconnect(&self, connection: &mut ConnectionState) {
        if let Some(handle) = connection.session.take() {
            self.leave(&handle);
        }
    }

    // ─── Maintenance ────────────────────────────────────────

    /// Reap expired sessions and locks and drop idle update logs. Returns
    /// how many sessions and locks expired.
    pub fn sweep(&self) -> (usize, usize) {
        let sessions = self.presence.purge_expired();
        let locks = self.locks.purge_expired();
        let logs = self.log.evict_idle();
        for lock in &locks {
            self.notifier.publish(
                lock.document_id,
                Notification::from_server(ServerEvent::LayerUnlocked {
                    layer_id: lock.layer_id.clone(),
                    user_id: lock.holder,
                }),
            );
        }
        if !sessions.is_empty() || !locks.is_empty() || logs > 0 {
            log::debug!(
                "Sweep expired {} session(s) and {} lock(s), evicted {logs} update log(s)",
                sessions.len(),
                locks.len()
            );
        }
        (sessions.len(), locks.len())
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the coordinator
    /// shuts down or is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if coordinator.is_closed() {
                    break;
                }
                coordinator.sweep();
            }
            log::debug!("Maintenance task stopped");
        })
    }

    /// Refuse new joins and edits, then flush pending auto-saves within
    /// `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        self.closed.store(true, Ordering::SeqCst);
        let report = self.autosave.shutdown_flush_all(deadline).await;
        log::info!(
            "Collaboration engine stopped: {} saved, {} unchanged, {} failed{}",
            report.saved,
            report.unchanged,
            report.failed,
            if report.timed_out { " (timed out)" } else { "" }
        );
        report
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CollabError::ShuttingDown);
        }
        Ok(())
    }

    fn ensure_live(&self, handle: &SessionHandle) -> Result<()> {
        match self.presence.session(handle.document_id, handle.connection_id) {
            Some(_) => Ok(()),
            None => Err(CollabError::SessionNotFound {
                document_id: handle.document_id,
                connection_id: handle.connection_id,
            }),
        }
    }

    fn locked_event(lock: &LayerLock) -> ServerEvent {
        ServerEvent::LayerLocked {
            layer_id: lock.layer_id.clone(),
            user_id: lock.holder,
            expires_at: lock.expires_at,
        }
    }
}

// ── tests ──
