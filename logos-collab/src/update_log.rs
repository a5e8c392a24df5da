//! Update log: bounded, sequenced record of accepted edits per document.
//!
//! Sequence numbers start at 1 and are assigned under a short per-document
//! critical section with no suspension point inside. Retention keeps at most
//! `max_events` events, all younger than `event_ttl`; trimming always removes
//! the oldest first, so the retained events are a contiguous run of
//! sequence numbers.
//!
//! Catch-up reads report [`CatchUp::ResyncRequired`] when part of the
//! requested window has been trimmed, instead of returning a silently
//! incomplete list.
//!
//! A log whose events have all expired can be evicted. Only its last
//! sequence and timestamp are kept, so numbering resumes where it stopped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::UpdateLogConfig;
use crate::{unix_millis, DocumentId, UserId};

/// One accepted edit. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub action: String,
    pub payload: Value,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub sequence: u64,
}

/// Result of a catch-up read.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchUp {
    /// Every event after the requested point, oldest first. May be empty.
    Events(Vec<UpdateEvent>),
    /// Events after the requested point have been trimmed; the client must
    /// reload full state.
    ResyncRequired {
        /// Oldest sequence still retained, if any.
        oldest_retained: Option<u64>,
        latest_sequence: u64,
    },
}

struct Retained {
    event: UpdateEvent,
    appended: Instant,
}

#[derive(Default)]
struct DocumentLog {
    events: VecDeque<Retained>,
    /// Last assigned sequence (0 = nothing appended yet).
    last_sequence: u64,
    /// Highest trimmed sequence and its timestamp.
    trimmed: Option<(u64, u64)>,
}

impl DocumentLog {
    fn trim(&mut self, config: &UpdateLogConfig, now: Instant) {
        while let Some(oldest) = self.events.front() {
            let over_count = self.events.len() > config.max_events;
            let expired = now.duration_since(oldest.appended) >= config.event_ttl;
            if !over_count && !expired {
                break;
            }
            if let Some(removed) = self.events.pop_front() {
                self.trimmed = Some((removed.event.sequence, removed.event.timestamp));
            }
        }
    }

    /// An empty log continuing after an evicted one.
    fn resumed(mark: (u64, u64)) -> Self {
        Self {
            events: VecDeque::new(),
            last_sequence: mark.0,
            trimmed: Some(mark),
        }
    }

    fn oldest_retained(&self) -> Option<u64> {
        self.events.front().map(|r| r.event.sequence)
    }
}

pub struct UpdateLog {
    documents: DashMap<DocumentId, Arc<Mutex<DocumentLog>>>,
    /// `(last_sequence, timestamp)` of evicted logs.
    evicted: DashMap<DocumentId, (u64, u64)>,
    config: UpdateLogConfig,
}

impl UpdateLog {
    pub fn new(config: UpdateLogConfig) -> Self {
        Self {
            documents: DashMap::new(),
            evicted: DashMap::new(),
            config,
        }
    }

    /// Record an accepted edit and assign its sequence number.
    pub fn append(
        &self,
        document_id: DocumentId,
        user_id: UserId,
        action: impl Into<String>,
        payload: Value,
    ) -> UpdateEvent {
        // Held for the whole append so eviction cannot orphan this log.
        let entry = self
            .documents
            .entry(document_id)
            .or_insert_with(|| Arc::new(Mutex::new(self.revive(document_id))));
        let mut log = lock(entry.value());
        let now = Instant::now();

        log.last_sequence += 1;
        let event = UpdateEvent {
            document_id,
            user_id,
            action: action.into(),
            payload,
            timestamp: unix_millis(),
            sequence: log.last_sequence,
        };
        log.events.push_back(Retained {
            event: event.clone(),
            appended: now,
        });
        log.trim(&self.config, now);

        log::trace!(
            "Appended {} #{} to document {document_id}",
            event.action,
            event.sequence
        );
        event
    }

    /// Up to `limit` most recent events, newest first.
    pub fn recent(&self, document_id: DocumentId, limit: usize) -> Vec<UpdateEvent> {
        let Some(shared) = self.existing(document_id) else {
            return Vec::new();
        };
        let mut log = lock(&shared);
        log.trim(&self.config, Instant::now());
        log.events
            .iter()
            .rev()
            .take(limit)
            .map(|r| r.event.clone())
            .collect()
    }

    /// Events with `timestamp > since_timestamp`, oldest first.
    pub fn recent_since(&self, document_id: DocumentId, since_timestamp: u64) -> CatchUp {
        let Some(shared) = self.existing(document_id) else {
            return CatchUp::Events(Vec::new());
        };
        let mut log = lock(&shared);
        log.trim(&self.config, Instant::now());

        if let Some((_, trimmed_at)) = log.trimmed {
            if trimmed_at > since_timestamp {
                return CatchUp::ResyncRequired {
                    oldest_retained: log.oldest_retained(),
                    latest_sequence: log.last_sequence,
                };
            }
        }

        CatchUp::Events(
            log.events
                .iter()
                .filter(|r| r.event.timestamp > since_timestamp)
                .map(|r| r.event.clone())
                .collect(),
        )
    }

    /// Events with `sequence > since_sequence`, oldest first.
    pub fn recent_since_sequence(&self, document_id: DocumentId, since_sequence: u64) -> CatchUp {
        let Some(shared) = self.existing(document_id) else {
            return CatchUp::Events(Vec::new());
        };
        let mut log = lock(&shared);
        log.trim(&self.config, Instant::now());

        if let Some((trimmed_sequence, _)) = log.trimmed {
            if trimmed_sequence > since_sequence {
                return CatchUp::ResyncRequired {
                    oldest_retained: log.oldest_retained(),
                    latest_sequence: log.last_sequence,
                };
            }
        }

        CatchUp::Events(
            log.events
                .iter()
                .filter(|r| r.event.sequence > since_sequence)
                .map(|r| r.event.clone())
                .collect(),
        )
    }

    /// Last assigned sequence number (0 if nothing was appended).
    pub fn latest_sequence(&self, document_id: DocumentId) -> u64 {
        self.existing(document_id).map_or(0, |shared| {
            let log = lock(&shared);
            log.last_sequence
        })
    }

    /// Number of retained events.
    pub fn len(&self, document_id: DocumentId) -> usize {
        self.existing(document_id).map_or(0, |shared| {
            let mut log = lock(&shared);
            log.trim(&self.config, Instant::now());
            log.events.len()
        })
    }

    pub fn is_empty(&self, document_id: DocumentId) -> bool {
        self.len(document_id) == 0
    }

    /// Drop a document's log once every event has expired. Returns whether
    /// it was dropped.
    pub fn remove_if_idle(&self, document_id: DocumentId) -> bool {
        let now = Instant::now();
        let removed = self
            .documents
            .remove_if(&document_id, |_, shared| {
                let mut log = lock(shared);
                log.trim(&self.config, now);
                if !log.events.is_empty() {
                    return false;
                }
                if let Some(mark) = log.trimmed {
                    self.evicted.insert(document_id, mark);
                }
                true
            })
            .is_some();
        if removed {
            log::debug!("Evicted idle update log for document {document_id}");
        }
        removed
    }

    /// [`remove_if_idle`](Self::remove_if_idle) for every document. Returns
    /// how many logs were dropped.
    pub fn evict_idle(&self) -> usize {
        let ids: Vec<DocumentId> = self.documents.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.remove_if_idle(*id)).count()
    }

    /// Documents with a live log.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn revive(&self, document_id: DocumentId) -> DocumentLog {
        self.evicted
            .get(&document_id)
            .map_or_else(DocumentLog::default, |mark| DocumentLog::resumed(*mark))
    }

    fn existing(&self, document_id: DocumentId) -> Option<Arc<Mutex<DocumentLog>>> {
        if let Some(entry) = self.documents.get(&document_id) {
            return Some(entry.value().clone());
        }
        self.evicted
            .get(&document_id)
            .map(|mark| Arc::new(Mutex::new(DocumentLog::resumed(*mark))))
    }
}

fn lock(log: &Mutex<DocumentLog>) -> MutexGuard<'_, DocumentLog> {
    log.lock().unwrap_or_else(|e| e.into_inner())
}
