//! Per-document fan-out of server events.
//!
//! Each document room is one tokio broadcast channel. A connection
//! subscribes after joining and gets an independent receiver that buffers
//! up to `capacity` notifications; a receiver that falls further behind
//! skips ahead and the skipped count is recorded as dropped.
//!
//! Notifications carry the connection they originated from so the server
//! can avoid echoing an event back to its sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::protocol::ServerEvent;
use crate::{ConnectionId, DocumentId};

/// An event published to a document room.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Connection that caused the event; `None` for server-initiated events
    /// such as expiry.
    pub origin: Option<ConnectionId>,
    pub event: ServerEvent,
}

impl Notification {
    pub fn from_connection(origin: ConnectionId, event: ServerEvent) -> Self {
        Self {
            origin: Some(origin),
            event,
        }
    }

    pub fn from_server(event: ServerEvent) -> Self {
        Self {
            origin: None,
            event,
        }
    }
}

/// Sink for room notifications.
pub trait Notifier: Send + Sync {
    fn publish(&self, document_id: DocumentId, notification: Notification);
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_rooms: usize,
}

/// Lock-free counters updated on the publish path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

type Room = broadcast::Sender<Arc<Notification>>;

/// Maps document ids to broadcast rooms.
///
/// The map lock is a std `RwLock` and is never held across an `.await`.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, Room>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl RoomManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Receive every notification published to the document from now on.
    pub fn subscribe(&self, document_id: DocumentId) -> broadcast::Receiver<Arc<Notification>> {
        self.get_or_create(document_id).subscribe()
    }

    fn get_or_create(&self, document_id: DocumentId) -> Room {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(&document_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&document_id) {
            return room.clone();
        }
        let (sender, _) = broadcast::channel(self.capacity);
        rooms.insert(document_id, sender.clone());
        log::debug!("Opened room for document {document_id}");
        sender
    }

    /// Drop the room if nobody is subscribed.
    pub fn remove_if_idle(&self, document_id: DocumentId) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        match rooms.get(&document_id) {
            Some(room) if room.receiver_count() == 0 => {
                rooms.remove(&document_id);
                log::debug!("Closed idle room for document {document_id}");
                true
            }
            _ => false,
        }
    }

    /// Number of live receivers on a document's room.
    pub fn subscriber_count(&self, document_id: DocumentId) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&document_id)
            .map_or(0, |room| room.receiver_count())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Record notifications a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_rooms: self.room_count(),
        }
    }
}

impl Notifier for RoomManager {
    fn publish(&self, document_id: DocumentId, notification: Notification) {
        let room = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(&document_id).cloned()
        };
        // No room means no subscribers; nothing to deliver.
        let Some(room) = room else {
            return;
        };
        if room.send(Arc::new(notification)).is_ok() {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;
    use uuid::Uuid;

    fn user_left() -> ServerEvent {
        ServerEvent::UserLeft {
            user_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let rooms = RoomManager::new(16);
        let doc = Uuid::new_v4();
        let mut rx1 = rooms.subscribe(doc);
        let mut rx2 = rooms.subscribe(doc);
        let origin = Uuid::new_v4();

        rooms.publish(doc, Notification::from_connection(origin, ServerEvent::Pong));

        // Filtering the origin is the receiver's job.
        for rx in [&mut rx1, &mut rx2] {
            let received = rx.recv().await.unwrap();
            assert_eq!(received.origin, Some(origin));
            assert_eq!(received.event, ServerEvent::Pong);
        }
        assert_eq!(rooms.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let rooms = RoomManager::new(16);
        let (doc1, doc2) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx1 = rooms.subscribe(doc1);
        let _rx2 = rooms.subscribe(doc2);

        rooms.publish(doc2, Notification::from_server(user_left()));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rooms.room_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_room_is_noop() {
        let rooms = RoomManager::new(16);
        rooms.publish(Uuid::new_v4(), Notification::from_server(ServerEvent::Pong));
        assert_eq!(rooms.stats(), BroadcastStats::default());
    }

    #[tokio::test]
    async fn test_remove_if_idle() {
        let rooms = RoomManager::new(16);
        let doc = Uuid::new_v4();
        let rx = rooms.subscribe(doc);

        assert!(!rooms.remove_if_idle(doc));
        assert_eq!(rooms.subscriber_count(doc), 1);

        drop(rx);
        assert!(rooms.remove_if_idle(doc));
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips_ahead() {
        let rooms = RoomManager::new(2);
        let doc = Uuid::new_v4();
        let mut rx = rooms.subscribe(doc);

        for _ in 0..5 {
            rooms.publish(doc, Notification::from_server(ServerEvent::Pong));
        }
        match rx.recv().await {
            Err(RecvError::Lagged(skipped)) => {
                assert_eq!(skipped, 3);
                rooms.record_dropped(skipped);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert!(rx.recv().await.is_ok());
        assert_eq!(rooms.stats().messages_dropped, 3);
    }
}
