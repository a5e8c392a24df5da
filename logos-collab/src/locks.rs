//! Lock manager: exclusive per-layer edit leases.
//!
//! A lock is a `set_if_absent` on `(document_id, layer_id)` in an
//! [`ExpiringKeyStore`], so at most one live lock exists per layer and
//! acquisition never waits. Every acquisition carries a fresh `lock_id`;
//! releases match on it, which keeps a cleanup that started before a new
//! acquisition from removing that newer lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{CollabError, Result};
use crate::kv::{ExpiringKeyStore, MemoryKeyStore};
use crate::{unix_millis, DocumentId, LayerId, UserId};

/// A live edit lease on one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerLock {
    pub document_id: DocumentId,
    pub layer_id: LayerId,
    pub holder: UserId,
    /// Unique per acquisition.
    pub lock_id: Uuid,
    /// Unix milliseconds.
    pub acquired_at: u64,
    /// Unix milliseconds.
    pub expires_at: u64,
}

type LockKey = (DocumentId, LayerId);

pub struct LockManager {
    locks: Arc<dyn ExpiringKeyStore<LockKey, LayerLock>>,
    config: LockConfig,
}

impl LockManager {
    /// Lock manager over an in-memory store.
    pub fn new(config: LockConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryKeyStore::new()))
    }

    pub fn with_store(config: LockConfig, locks: Arc<dyn ExpiringKeyStore<LockKey, LayerLock>>) -> Self {
        Self { locks, config }
    }

    /// Try to take the lock. `false` if any live lock exists, including one
    /// already held by `user_id`.
    pub fn try_lock(&self, document_id: DocumentId, layer_id: &str, user_id: UserId) -> bool {
        self.acquire(document_id, layer_id, user_id).is_ok()
    }

    /// Take the lock, or report who holds it.
    pub fn acquire(&self, document_id: DocumentId, layer_id: &str, user_id: UserId) -> Result<LayerLock> {
        let now = unix_millis();
        let lock = LayerLock {
            document_id,
            layer_id: layer_id.to_string(),
            holder: user_id,
            lock_id: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + self.config.lock_ttl.as_millis() as u64,
        };

        match self.locks.set_if_absent(
            (document_id, layer_id.to_string()),
            lock.clone(),
            self.config.lock_ttl,
        ) {
            Ok(()) => {
                log::info!("User {user_id} locked layer '{layer_id}' of document {document_id}");
                Ok(lock)
            }
            Err(current) => {
                log::debug!(
                    "User {user_id} denied layer '{layer_id}' of document {document_id}: held by {}",
                    current.holder
                );
                Err(CollabError::LayerLocked {
                    layer_id: layer_id.to_string(),
                    holder: current.holder,
                })
            }
        }
    }

    /// Release the lock if `user_id` holds it; otherwise do nothing.
    /// Returns the released lock.
    pub fn unlock(&self, document_id: DocumentId, layer_id: &str, user_id: UserId) -> Option<LayerLock> {
        let released = self
            .locks
            .remove_if(&(document_id, layer_id.to_string()), &|lock| lock.holder == user_id)?;
        log::info!("User {user_id} unlocked layer '{layer_id}' of document {document_id}");
        Some(released)
    }

    pub fn lock_holder(&self, document_id: DocumentId, layer_id: &str) -> Option<UserId> {
        self.lock(document_id, layer_id).map(|lock| lock.holder)
    }

    pub fn lock(&self, document_id: DocumentId, layer_id: &str) -> Option<LayerLock> {
        self.locks.get(&(document_id, layer_id.to_string()))
    }

    /// Extend the holder's lease by a full TTL. `false` if `user_id` does not
    /// hold the lock.
    pub fn refresh(&self, document_id: DocumentId, layer_id: &str, user_id: UserId) -> bool {
        let expires_at = unix_millis() + self.config.lock_ttl.as_millis() as u64;
        self.locks.refresh(
            &(document_id, layer_id.to_string()),
            self.config.lock_ttl,
            &|lock| {
                if lock.holder != user_id {
                    return false;
                }
                lock.expires_at = expires_at;
                true
            },
        )
    }

    /// Release every lock `user_id` holds on the document right now.
    ///
    /// Locks are matched by `lock_id`, so a lock taken after the scan (even
    /// by the same user) survives. Idempotent.
    pub fn release_all_for(&self, document_id: DocumentId, user_id: UserId) -> Vec<LayerLock> {
        let held = self
            .locks
            .scan(&|key, lock| key.0 == document_id && lock.holder == user_id);

        let released: Vec<LayerLock> = held
            .into_iter()
            .filter_map(|(key, lock)| {
                let lock_id = lock.lock_id;
                self.locks.remove_if(&key, &|current| current.lock_id == lock_id)
            })
            .collect();

        if !released.is_empty() {
            log::info!(
                "Released {} lock(s) of user {user_id} on document {document_id}",
                released.len()
            );
        }
        released
    }

    /// Live locks on a document, ordered by layer id.
    pub fn locks_for(&self, document_id: DocumentId) -> Vec<LayerLock> {
        let mut locks: Vec<LayerLock> = self
            .locks
            .scan(&|key, _| key.0 == document_id)
            .into_iter()
            .map(|(_, lock)| lock)
            .collect();
        locks.sort_by(|a, b| a.layer_id.cmp(&b.layer_id));
        locks
    }

    /// Drop expired locks everywhere and return them.
    pub fn purge_expired(&self) -> Vec<LayerLock> {
        let expired: Vec<LayerLock> = self
            .locks
            .purge_expired()
            .into_iter()
            .map(|(_, lock)| lock)
            .collect();
        for lock in &expired {
            log::info!(
                "Lock on layer '{}' of document {} held by {} expired",
                lock.layer_id,
                lock.document_id,
                lock.holder
            );
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> LockManager {
        LockManager::new(LockConfig {
            lock_ttl: Duration::from_secs(10 * 60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_user_rejected() {
        let locks = manager();
        let doc = Uuid::new_v4();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(locks.try_lock(doc, "sleeve-1", u1));
        assert!(!locks.try_lock(doc, "sleeve-1", u2));
        assert_eq!(locks.lock_holder(doc, "sleeve-1"), Some(u1));

        match locks.acquire(doc, "sleeve-1", u2) {
            Err(CollabError::LayerLocked { holder, .. }) => assert_eq!(holder, u1),
            other => panic!("expected LayerLocked, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_relock_by_holder_fails_fast() {
        let locks = manager();
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        assert!(locks.try_lock(doc, "a", user));
        assert!(!locks.try_lock(doc, "a", user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_only_by_holder_and_idempotent() {
        let locks = manager();
        let doc = Uuid::new_v4();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        locks.try_lock(doc, "a", u1);

        assert!(locks.unlock(doc, "a", u2).is_none());
        assert_eq!(locks.lock_holder(doc, "a"), Some(u1));

        assert!(locks.unlock(doc, "a", u1).is_some());
        assert!(locks.unlock(doc, "a", u1).is_none());
        assert_eq!(locks.lock_holder(doc, "a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires() {
        let locks = manager();
        let doc = Uuid::new_v4();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        locks.try_lock(doc, "a", u1);

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert_eq!(locks.lock_holder(doc, "a"), None);
        assert!(locks.try_lock(doc, "a", u2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_and_eager_expiry_agree() {
        let locks = manager();
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        locks.try_lock(doc, "a", user);
        locks.try_lock(doc, "b", user);

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        assert!(locks.locks_for(doc).is_empty());
        let purged = locks.purge_expired();
        assert_eq!(purged.len(), 2);
        assert!(locks.locks_for(doc).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_holder_only() {
        let locks = manager();
        let doc = Uuid::new_v4();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        locks.try_lock(doc, "a", u1);

        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert!(!locks.refresh(doc, "a", u2));
        assert!(locks.refresh(doc, "a", u1));
        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        assert_eq!(locks.lock_holder(doc, "a"), Some(u1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_all_for_scoped_to_user_and_document() {
        let locks = manager();
        let (doc, other_doc) = (Uuid::new_v4(), Uuid::new_v4());
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        locks.try_lock(doc, "a", u1);
        locks.try_lock(doc, "b", u1);
        locks.try_lock(doc, "c", u2);
        locks.try_lock(other_doc, "a", u1);

        let released = locks.release_all_for(doc, u1);
        assert_eq!(released.len(), 2);
        assert_eq!(locks.lock_holder(doc, "c"), Some(u2));
        assert_eq!(locks.lock_holder(other_doc, "a"), Some(u1));
        assert!(locks.release_all_for(doc, u1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_does_not_clobber_newer_lock() {
        let store: Arc<MemoryKeyStore<LockKey, LayerLock>> = Arc::new(MemoryKeyStore::new());
        let locks = LockManager::with_store(LockConfig::default(), store.clone());
        let doc = Uuid::new_v4();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

        let old = locks.acquire(doc, "a", u1).unwrap();
        // Simulate the old lock being released and re-taken between the
        // departure scan and the removal.
        locks.unlock(doc, "a", u1);
        let newer = locks.acquire(doc, "a", u2).unwrap();

        let key = (doc, "a".to_string());
        assert!(store.remove_if(&key, &|current| current.lock_id == old.lock_id).is_none());
        assert_eq!(locks.lock(doc, "a"), Some(newer));
    }

    #[tokio::test]
    async fn test_concurrent_try_lock_single_winner() {
        let locks = Arc::new(manager());
        let doc = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.try_lock(doc, "sleeve-1", Uuid::new_v4())
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
