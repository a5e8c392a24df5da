//! TTL key store with conditional writes.
//!
//! Presence sessions and layer locks both live behind [`ExpiringKeyStore`].
//! An entry whose deadline has passed is absent for every read and every
//! conditional write (lazy expiry); [`ExpiringKeyStore::purge_expired`] is
//! the eager sweep that also hands back what it removed so callers can run
//! their side effects.
//!
//! Deadlines use `tokio::time::Instant` so paused-clock tests can drive
//! expiry with `tokio::time::advance`.

use std::hash::Hash;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

/// Key/value store whose entries expire.
///
/// Every method is atomic per key. Implementations never block on I/O from
/// inside these calls, so they are safe to use from sync and async code.
pub trait ExpiringKeyStore<K, V>: Send + Sync {
    /// Unconditionally write `value`, replacing any previous entry.
    fn set(&self, key: K, value: V, ttl: Duration);

    /// Write `value` only if no live entry exists. On conflict the current
    /// value is returned.
    fn set_if_absent(&self, key: K, value: V, ttl: Duration) -> Result<(), V>;

    fn get(&self, key: &K) -> Option<V>;

    fn delete(&self, key: &K) -> Option<V>;

    /// Remove the entry only if it is live and `predicate` accepts it.
    fn remove_if(&self, key: &K, predicate: &dyn Fn(&V) -> bool) -> Option<V>;

    /// Push the deadline of a live entry to `now + ttl` if `touch` returns
    /// true. `touch` may update the value in place; its changes are kept
    /// only when it returns true.
    fn refresh(&self, key: &K, ttl: Duration, touch: &dyn Fn(&mut V) -> bool) -> bool;

    /// All live entries accepted by `predicate`.
    fn scan(&self, predicate: &dyn Fn(&K, &V) -> bool) -> Vec<(K, V)>;

    /// Drop every expired entry and return them.
    fn purge_expired(&self) -> Vec<(K, V)>;
}

struct Slot<V> {
    value: V,
    deadline: Instant,
}

impl<V> Slot<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            deadline: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.deadline
    }
}

/// In-memory [`ExpiringKeyStore`] on a sharded concurrent map.
pub struct MemoryKeyStore<K, V> {
    entries: DashMap<K, Slot<V>>,
}

impl<K, V> MemoryKeyStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }
}

impl<K, V> Default for MemoryKeyStore<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ExpiringKeyStore<K, V> for MemoryKeyStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn set(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(key, Slot::new(value, ttl));
    }

    fn set_if_absent(&self, key: K, value: V, ttl: Duration) -> Result<(), V> {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Err(occupied.get().value.clone());
                }
                occupied.insert(Slot::new(value, ttl));
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl));
                Ok(())
            }
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    fn delete(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .remove(key)
            .filter(|(_, slot)| slot.is_live(now))
            .map(|(_, slot)| slot.value)
    }

    fn remove_if(&self, key: &K, predicate: &dyn Fn(&V) -> bool) -> Option<V> {
        let now = Instant::now();
        self.entries
            .remove_if(key, |_, slot| slot.is_live(now) && predicate(&slot.value))
            .map(|(_, slot)| slot.value)
    }

    fn refresh(&self, key: &K, ttl: Duration, touch: &dyn Fn(&mut V) -> bool) -> bool {
        let now = Instant::now();
        let Some(mut slot) = self.entries.get_mut(key) else {
            return false;
        };
        if !slot.is_live(now) {
            return false;
        }
        let mut value = slot.value.clone();
        if !touch(&mut value) {
            return false;
        }
        slot.value = value;
        slot.deadline = now + ttl;
        true
    }

    fn scan(&self, predicate: &dyn Fn(&K, &V) -> bool) -> Vec<(K, V)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_live(now) && predicate(entry.key(), &entry.value().value))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    fn purge_expired(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect();

        // Re-checked under the shard lock: a key may have been re-set since the scan.
        expired
            .into_iter()
            .filter_map(|key| self.entries.remove_if(&key, |_, slot| !slot.is_live(now)))
            .map(|(key, slot)| (key, slot.value))
            .collect()
    }
}

// ── tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_set_get_expire() {
        let store = MemoryKeyStore::new();
        store.set("a", 1, TTL);
        assert_eq!(store.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get(&"a"), None);
        // Lazily expired entries are still stored until purged.
        assert_eq!(store.raw_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_conflict_returns_current() {
        let store = MemoryKeyStore::new();
        assert!(store.set_if_absent("layer", "alice", TTL).is_ok());
        assert_eq!(store.set_if_absent("layer", "bob", TTL), Err("alice"));
        assert_eq!(store.get(&"layer"), Some("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_replaces_expired() {
        let store = MemoryKeyStore::new();
        store.set_if_absent("layer", "alice", TTL).unwrap();
        tokio::time::advance(TTL).await;
        assert!(store.set_if_absent("layer", "bob", TTL).is_ok());
        assert_eq!(store.get(&"layer"), Some("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_if_respects_predicate() {
        let store = MemoryKeyStore::new();
        store.set("k", "alice", TTL);
        assert_eq!(store.remove_if(&"k", &|v| *v == "bob"), None);
        assert_eq!(store.remove_if(&"k", &|v| *v == "alice"), Some("alice"));
        assert_eq!(store.remove_if(&"k", &|v| *v == "alice"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_deadline() {
        let store = MemoryKeyStore::new();
        store.set("k", 7, TTL);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.refresh(&"k", TTL, &|_| true));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get(&"k"), Some(7));

        assert!(!store.refresh(&"k", TTL, &|v| *v == 8));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store.refresh(&"k", TTL, &|_| true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_can_update_value() {
        let store = MemoryKeyStore::new();
        store.set("k", 1, TTL);
        assert!(store.refresh(&"k", TTL, &|v| {
            *v += 1;
            true
        }));
        assert_eq!(store.get(&"k"), Some(2));

        // Rejected touches leave the value alone.
        assert!(!store.refresh(&"k", TTL, &|v| {
            *v = 100;
            false
        }));
        assert_eq!(store.get(&"k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_skips_expired() {
        let store = MemoryKeyStore::new();
        store.set(1, "short", Duration::from_secs(1));
        store.set(2, "long", TTL);
        store.set(3, "long", TTL);
        tokio::time::advance(Duration::from_secs(2)).await;

        let mut live = store.scan(&|_, v| *v == "long");
        live.sort();
        assert_eq!(live, vec![(2, "long"), (3, "long")]);
        assert!(store.scan(&|_, v| *v == "short").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_returns_removed() {
        let store = MemoryKeyStore::new();
        store.set("old", 1, Duration::from_secs(1));
        store.set("new", 2, TTL);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.purge_expired(), vec![("old", 1)]);
        assert_eq!(store.raw_len(), 1);
        assert!(store.purge_expired().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_set_if_absent_single_winner() {
        let store: Arc<MemoryKeyStore<&str, usize>> = Arc::new(MemoryKeyStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set_if_absent("layer", i, TTL).is_ok()
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
