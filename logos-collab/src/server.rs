//! WebSocket server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  JSON ClientEvent                   ┌── PresenceRegistry
//!            ├──────────────► SessionCoordinator ──┼── LockManager
//! Client B ──┘                      │              ├── UpdateLog
//!      ▲                            │              └── AutoSave ── VersionController
//!      │                            ▼                                  │
//!      └──── ServerEvent ──── RoomManager (doc_id)         SnapshotStore (RocksDB / memory)
//! ```
//!
//! One task per connection. A connection is bound to at most one document;
//! after a successful `join` it subscribes to that document's room and
//! forwards every notification that did not originate from itself.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::autosave::ShutdownReport;
use crate::broadcast::{Notification, RoomManager};
use crate::config::CollabConfig;
use crate::error::CollabError;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::{ConnectionState, SessionCoordinator};
use crate::storage::{
    DocumentStateStore, MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig,
    StoreError,
};
use crate::DocumentId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Snapshot database path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            collab: CollabConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            storage_path: None,
            collab: CollabConfig::for_testing(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that could not be decoded as a client event.
    pub rejected_frames: u64,
    pub active_rooms: usize,
}

struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_frames: AtomicU64,
}

impl AtomicServerStats {
    fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            rejected_frames: AtomicU64::new(0),
        }
    }
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<SessionCoordinator>,
    room_manager: Arc<RoomManager>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server over the given document store. Snapshots go to
    /// RocksDB when `storage_path` is set, otherwise to memory.
    pub fn open(config: ServerConfig, documents: Arc<dyn DocumentStateStore>) -> Result<Self, StoreError> {
        let snapshots: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksSnapshotStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Snapshots persisted to {}", path.display());
                Arc::new(store)
            }
            None => {
                log::info!("Snapshots kept in memory");
                Arc::new(MemorySnapshotStore::new())
            }
        };
        Ok(Self::with_stores(config, documents, snapshots))
    }

    pub fn with_stores(
        config: ServerConfig,
        documents: Arc<dyn DocumentStateStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        let coordinator = Arc::new(SessionCoordinator::new(
            config.collab.clone(),
            documents,
            snapshots,
            room_manager.clone(),
        ));
        Self {
            config,
            coordinator,
            room_manager,
            stats: Arc::new(AtomicServerStats::new()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        self.coordinator
            .spawn_maintenance(self.config.collab.sweep_interval);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let room_manager = self.room_manager.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, room_manager, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<SessionCoordinator>,
        room_manager: Arc<RoomManager>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut connection = ConnectionState::new(Uuid::new_v4());
        let mut subscribed: Option<DocumentId> = None;
        let mut room_rx: Option<broadcast::Receiver<Arc<Notification>>> = None;
        log::info!(
            "WebSocket connection {} established from {addr}",
            connection.connection_id
        );

        let outcome = async {
            loop {
                tokio::select! {
                    // Incoming client frame
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                stats.total_messages.fetch_add(1, Ordering::Relaxed);
                                stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                                let replies = match ClientEvent::decode(text.as_str()) {
                                    Ok(event) => coordinator.handle(&mut connection, event).await,
                                    Err(e) => {
                                        log::warn!("Rejected frame from {addr}: {e}");
                                        stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                        vec![ServerEvent::from(&e)]
                                    }
                                };

                                // Follow the session to its document's room.
                                let joined = connection.session.map(|s| s.document_id);
                                if joined != subscribed {
                                    room_rx = joined.map(|doc| room_manager.subscribe(doc));
                                    if let Some(previous) = subscribed {
                                        room_manager.remove_if_idle(previous);
                                    }
                                    subscribed = joined;
                                }

                                for reply in replies {
                                    ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                let e = CollabError::Protocol("binary frames are not supported".into());
                                ws_sender.send(Message::Text(ServerEvent::from(&e).encode()?.into())).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Room notification
                    notification = async {
                        match room_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            // Not joined yet — wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match notification {
                            Ok(notification) => {
                                // Don't echo back to sender
                                if notification.origin == Some(connection.connection_id) {
                                    continue;
                                }
                                let text = notification.event.encode()?;
                                ws_sender.send(Message::Text(text.into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {} lagged by {n} notifications", connection.connection_id);
                                room_manager.record_dropped(n);
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                room_rx = None;
                            }
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup runs whatever ended the loop.
        coordinator.disconnect(&mut connection);
        drop(room_rx);
        if let Some(document_id) = subscribed {
            room_manager.remove_if_idle(document_id);
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {} from {addr} finished", connection.connection_id);

        outcome
    }

    /// Stop accepting joins and edits and flush pending auto-saves.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.coordinator
            .shutdown(self.config.collab.auto_save.shutdown_deadline)
            .await
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            rejected_frames: self.stats.rejected_frames.load(Ordering::Relaxed),
            active_rooms: self.room_manager.room_count(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDocumentStore;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[tokio::test]
    async fn test_server_in_memory() {
        let server = SyncServer::open(ServerConfig::default(), Arc::new(MemoryDocumentStore::new())).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats(), ServerStats::default());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::open(config, Arc::new(MemoryDocumentStore::new())).unwrap();
        assert!(dir.path().join("db").exists());
        assert_eq!(server.room_manager().room_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_nothing_pending() {
        let server = SyncServer::open(ServerConfig::for_testing(), Arc::new(MemoryDocumentStore::new())).unwrap();
        let report = server.shutdown().await;
        assert_eq!(report.pending, 0);
        assert!(!report.timed_out);
        assert!(server.coordinator().is_closed());
    }
}
