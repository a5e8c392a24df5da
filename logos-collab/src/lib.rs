//! # logos-collab — Collaboration & versioning engine for Logos
//!
//! Lets several users edit one layered design document at the same time.
//! Conflicts are avoided with coarse per-layer edit leases rather than
//! merging; bursts of edits are coalesced into debounced auto-save
//! snapshots, and every snapshot is a numbered version that can be diffed
//! against any other or restored.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON frames    ┌─────────────┐
//! │  Client     │ ◄──────────────► │ SyncServer  │
//! └─────────────┘                  └──────┬──────┘
//!                                         │ ClientEvent
//!                                  ┌──────▼─────────────┐      ┌─────────────┐
//!                                  │ SessionCoordinator │ ───► │ RoomManager │
//!                                  └──┬────┬────┬────┬──┘      │ (fan-out)   │
//!                  ┌──────────────────┘    │    │    └──────┐  └─────────────┘
//!                  ▼                       ▼    ▼           ▼
//!         ┌────────────────┐   ┌───────────┐ ┌───────────┐ ┌───────────────────┐
//!         │PresenceRegistry│──►│LockManager│ │ UpdateLog │ │ AutoSaveScheduler │
//!         └───────┬────────┘   └─────┬─────┘ └───────────┘ └─────────┬─────────┘
//!                 └──── ExpiringKeyStore ┘                           ▼
//!                                                         ┌───────────────────┐
//!                                                         │ VersionController │
//!                                                         └──┬─────────────┬──┘
//!                                                            ▼             ▼
//!                                                 DocumentStateStore  SnapshotStore
//!                                                                   (memory / RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`kv`] — TTL key store with conditional writes
//! - [`presence`] — live sessions per document
//! - [`locks`] — exclusive per-layer edit leases
//! - [`update_log`] — bounded, sequenced log of accepted edits
//! - [`versions`] — snapshot creation, diff and restore
//! - [`autosave`] — debounced snapshot scheduling
//! - [`storage`] — document state and snapshot persistence seams
//! - [`broadcast`] — per-document notification fan-out
//! - [`session`] — connection-level orchestration of all of the above
//! - [`server`] — WebSocket transport adapter

pub mod autosave;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod kv;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod update_log;
pub mod versions;

use std::time::{SystemTime, UNIX_EPOCH};

pub use logos_core::{DocumentId, DocumentState, LayerId, UserId};

/// Identifies one client connection (one browser tab).
pub type ConnectionId = uuid::Uuid;

// Re-exports for convenience
pub use autosave::{AutoSaveOutcome, AutoSaveScheduler, AutoSaveState, AutoSaveStats, ShutdownReport};
pub use broadcast::{BroadcastStats, Notification, Notifier, RoomManager};
pub use config::{
    AutoSaveConfig, CollabConfig, LockConfig, PresenceConfig, UpdateLogConfig, VersionConfig,
};
pub use error::{CollabError, Result};
pub use kv::{ExpiringKeyStore, MemoryKeyStore};
pub use locks::{LayerLock, LockManager};
pub use presence::{DepartureListener, PresenceRegistry, Session, SessionHandle};
pub use protocol::{ClientEvent, ServerEvent};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::SessionCoordinator;
pub use storage::{
    DocumentStateStore, MemoryDocumentStore, MemorySnapshotStore, RocksSnapshotStore,
    SnapshotStore, StoreConfig, StoreError,
};
pub use update_log::{CatchUp, UpdateEvent, UpdateLog};
pub use versions::{
    FieldChange, LayerChanges, LayerModification, Restored, Snapshot, SnapshotKind, Version,
    VersionController, VersionDiff,
};

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
