//! Presence registry: which users are live on which documents.
//!
//! One [`Session`] per connection, stored in an [`ExpiringKeyStore`] with a
//! heartbeat TTL. A session that stops heartbeating simply expires; readers
//! never see it again, and the next `purge_expired` runs its departure side
//! effects. The coordinator purges before every join, lock and edit.
//!
//! ```text
//! join ──► set((doc, conn), session, ttl)
//! heartbeat ──► refresh
//! leave / expiry ──► session_ended ──► last session of user on doc?
//!                                         └──► user_departed (releases locks)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::PresenceConfig;
use crate::error::{CollabError, Result};
use crate::kv::{ExpiringKeyStore, MemoryKeyStore};
use crate::{unix_millis, ConnectionId, DocumentId, UserId};

/// A live client connection bound to a document and user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub document_id: DocumentId,
    /// Unix milliseconds.
    pub joined_at: u64,
    /// Unix milliseconds.
    pub last_heartbeat: u64,
}

/// Returned by [`PresenceRegistry::join`]; identifies the session for later calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

/// Notified when sessions disappear through leave or expiry.
pub trait DepartureListener: Send + Sync {
    /// One connection's session is gone.
    fn session_ended(&self, _session: &Session) {}

    /// The user's last session on the document is gone.
    fn user_departed(&self, document_id: DocumentId, user_id: UserId);
}

type SessionKey = (DocumentId, ConnectionId);

pub struct PresenceRegistry {
    sessions: Arc<dyn ExpiringKeyStore<SessionKey, Session>>,
    listener: Arc<dyn DepartureListener>,
    config: PresenceConfig,
}

impl PresenceRegistry {
    /// Registry over an in-memory store.
    pub fn new(config: PresenceConfig, listener: Arc<dyn DepartureListener>) -> Self {
        Self::with_store(config, Arc::new(MemoryKeyStore::new()), listener)
    }

    pub fn with_store(
        config: PresenceConfig,
        sessions: Arc<dyn ExpiringKeyStore<SessionKey, Session>>,
        listener: Arc<dyn DepartureListener>,
    ) -> Self {
        Self {
            sessions,
            listener,
            config,
        }
    }

    /// Register a connection. Joins of the same user from different
    /// connections are independent sessions.
    pub fn join(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> SessionHandle {
        let now = unix_millis();
        let session = Session {
            user_id,
            connection_id,
            document_id,
            joined_at: now,
            last_heartbeat: now,
        };
        self.sessions
            .set((document_id, connection_id), session, self.config.session_ttl);

        log::info!("User {user_id} joined document {document_id} (connection {connection_id})");
        SessionHandle {
            document_id,
            user_id,
            connection_id,
        }
    }

    /// Drop a session. Unknown or repeated leaves are no-ops.
    pub fn leave(&self, document_id: DocumentId, connection_id: ConnectionId) -> Option<Session> {
        let session = self.sessions.delete(&(document_id, connection_id))?;
        log::info!(
            "User {} left document {document_id} (connection {connection_id})",
            session.user_id
        );
        self.listener.session_ended(&session);
        self.check_departure(document_id, session.user_id);
        Some(session)
    }

    /// Extend a session's liveness. An expired or unknown session is
    /// reported so the client can rejoin.
    pub fn heartbeat(&self, document_id: DocumentId, connection_id: ConnectionId) -> Result<()> {
        let now = unix_millis();
        let refreshed = self.sessions.refresh(
            &(document_id, connection_id),
            self.config.session_ttl,
            &|session| {
                session.last_heartbeat = now;
                true
            },
        );

        if refreshed {
            log::trace!("Heartbeat from {connection_id} on document {document_id}");
            return Ok(());
        }

        // The session may have just expired; make sure its departure runs.
        self.purge_expired();
        Err(CollabError::SessionNotFound {
            document_id,
            connection_id,
        })
    }

    /// Live sessions on a document. Expired sessions are reaped first.
    pub fn list_active(&self, document_id: DocumentId) -> Vec<Session> {
        self.purge_expired();
        let mut sessions: Vec<Session> = self
            .sessions
            .scan(&|key, _| key.0 == document_id)
            .into_iter()
            .map(|(_, session)| session)
            .collect();
        sessions.sort_by_key(|s| (s.joined_at, s.connection_id));
        sessions
    }

    /// The live session of one connection.
    pub fn session(&self, document_id: DocumentId, connection_id: ConnectionId) -> Option<Session> {
        self.sessions.get(&(document_id, connection_id))
    }

    /// Whether the user has any live session on the document.
    pub fn is_present(&self, document_id: DocumentId, user_id: UserId) -> bool {
        !self
            .sessions
            .scan(&|key, session| key.0 == document_id && session.user_id == user_id)
            .is_empty()
    }

    /// Remove expired sessions everywhere and run departures for users left
    /// without a live session. Returns the expired sessions.
    pub fn purge_expired(&self) -> Vec<Session> {
        let expired: Vec<Session> = self
            .sessions
            .purge_expired()
            .into_iter()
            .map(|(_, session)| session)
            .collect();

        let mut checked = HashSet::new();
        for session in &expired {
            log::info!(
                "Session {} of user {} on document {} expired",
                session.connection_id,
                session.user_id,
                session.document_id
            );
            self.listener.session_ended(session);
            if checked.insert((session.document_id, session.user_id)) {
                self.check_departure(session.document_id, session.user_id);
            }
        }
        expired
    }

    fn check_departure(&self, document_id: DocumentId, user_id: UserId) {
        if !self.is_present(document_id, user_id) {
            log::debug!("User {user_id} has no sessions left on document {document_id}");
            self.listener.user_departed(document_id, user_id);
        }
    }
}
