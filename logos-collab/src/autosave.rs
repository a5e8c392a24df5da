//! Debounced auto-save.
//!
//! Per document:
//!
//! ```text
//!            schedule            timer fires            save done / failed
//!   Idle ───────────────► Scheduled ──────────► Saving ─────────────────────► Idle
//!     ▲   cancel              │  ▲                 │
//!     └───────────────────────┘  └── schedule ─────┘ (new timer; the running
//!                                                     save is left alone)
//! ```
//!
//! Every `schedule`/`cancel` gives the document a fresh generation from a
//! scheduler-wide counter. A timer only acts if the generation it was spawned
//! with is still current, so a stale timer that fires late is a no-op. The
//! Saving → Idle transition happens in a drop guard and therefore also runs
//! when the save fails or panics. Idle documents are not tracked at all.
//!
//! A save compares the current document state with the latest snapshot and
//! writes nothing if they are structurally equal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::AutoSaveConfig;
use crate::error::Result;
use crate::versions::{Version, VersionController};
use crate::{DocumentId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoSaveState {
    Idle,
    Scheduled,
    Saving,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutoSaveOutcome {
    Saved(Version),
    /// State equal to the latest snapshot; nothing written.
    Unchanged,
}

/// Counters for monitoring auto-save health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoSaveStats {
    pub attempted: u64,
    pub written: u64,
    pub skipped_unchanged: u64,
    pub failed: u64,
}

/// What a shutdown flush achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Documents that had a pending timer.
    pub pending: usize,
    pub saved: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// The deadline passed before every flush finished.
    pub timed_out: bool,
}

struct AtomicAutoSaveStats {
    attempted: AtomicU64,
    written: AtomicU64,
    skipped_unchanged: AtomicU64,
    failed: AtomicU64,
}

impl AtomicAutoSaveStats {
    fn new() -> Self {
        Self {
            attempted: AtomicU64::new(0),
            written: AtomicU64::new(0),
            skipped_unchanged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

struct Timer {
    state: AutoSaveState,
    generation: u64,
    /// Generation that started the running save.
    saving_generation: u64,
    user_id: UserId,
    scheduled_at: Option<Instant>,
    /// Sleeping timer task (Scheduled).
    pending: Option<JoinHandle<()>>,
    /// Timer task that has moved on to saving.
    in_flight: Option<JoinHandle<()>>,
}

impl Timer {
    fn idle(user_id: UserId) -> Self {
        Self {
            state: AutoSaveState::Idle,
            generation: 0,
            saving_generation: 0,
            user_id,
            scheduled_at: None,
            pending: None,
            in_flight: None,
        }
    }

    /// Invalidate a pending timer. Returns whether one was pending.
    fn cancel_pending(&mut self, generation: u64) -> bool {
        self.generation = generation;
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        let was_scheduled = self.state == AutoSaveState::Scheduled;
        if was_scheduled {
            self.state = AutoSaveState::Idle;
            self.scheduled_at = None;
        }
        was_scheduled
    }
}

struct Inner {
    timers: DashMap<DocumentId, Timer>,
    generations: AtomicU64,
    versions: Arc<VersionController>,
    config: AutoSaveConfig,
    closed: AtomicBool,
    stats: AtomicAutoSaveStats,
}

impl Inner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Returns a document to Idle when its save ends, however it ends.
struct SavingGuard {
    inner: Arc<Inner>,
    document_id: DocumentId,
    generation: u64,
}

impl Drop for SavingGuard {
    fn drop(&mut self) {
        // A schedule that arrived mid-save owns the entry now.
        self.inner.timers.remove_if(&self.document_id, |_, timer| {
            timer.state == AutoSaveState::Saving && timer.saving_generation == self.generation
        });
    }
}

#[derive(Clone)]
pub struct AutoSaveScheduler {
    inner: Arc<Inner>,
}

impl AutoSaveScheduler {
    pub fn new(versions: Arc<VersionController>, config: AutoSaveConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: DashMap::new(),
                generations: AtomicU64::new(0),
                versions,
                config,
                closed: AtomicBool::new(false),
                stats: AtomicAutoSaveStats::new(),
            }),
        }
    }

    /// (Re)start the debounce timer for a document. Any pending timer is
    /// replaced. Returns `false` once shutdown has begun.
    pub fn schedule(&self, document_id: DocumentId, user_id: UserId) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            log::debug!("Auto-save for document {document_id} refused: shutting down");
            return false;
        }

        let delay = self.inner.config.debounce;
        let mut timer = self
            .inner
            .timers
            .entry(document_id)
            .or_insert_with(|| Timer::idle(user_id));

        let generation = self.inner.next_generation();
        timer.cancel_pending(generation);
        timer.state = AutoSaveState::Scheduled;
        timer.user_id = user_id;
        timer.scheduled_at = Some(Instant::now());

        let inner = self.inner.clone();
        timer.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::fire(inner, document_id, generation).await;
        }));

        log::trace!("Auto-save for document {document_id} scheduled (generation {generation})");
        true
    }

    /// Drop a pending timer. Returns whether one was pending.
    pub fn cancel(&self, document_id: DocumentId) -> bool {
        let generation = self.inner.next_generation();
        let was_pending = match self.inner.timers.get_mut(&document_id) {
            Some(mut timer) => timer.cancel_pending(generation),
            None => false,
        };
        self.inner
            .timers
            .remove_if(&document_id, |_, timer| timer.state == AutoSaveState::Idle);
        was_pending
    }

    /// Save now, replacing any pending timer.
    pub async fn flush_now(&self, document_id: DocumentId, user_id: UserId) -> Result<AutoSaveOutcome> {
        let generation = {
            let mut timer = self
                .inner
                .timers
                .entry(document_id)
                .or_insert_with(|| Timer::idle(user_id));
            let generation = self.inner.next_generation();
            timer.cancel_pending(generation);
            timer.state = AutoSaveState::Saving;
            timer.saving_generation = generation;
            timer.user_id = user_id;
            generation
        };

        let _guard = SavingGuard {
            inner: self.inner.clone(),
            document_id,
            generation,
        };
        Self::save(&self.inner, document_id, user_id).await
    }

    /// Stop accepting schedules, then flush every document that had a
    /// pending timer and wait for saves already running, all within
    /// `deadline`.
    pub async fn shutdown_flush_all(&self, deadline: Duration) -> ShutdownReport {
        self.inner.closed.store(true, Ordering::SeqCst);

        let mut pending = Vec::new();
        let mut in_flight = Vec::new();
        for mut entry in self.inner.timers.iter_mut() {
            let document_id = *entry.key();
            let timer = entry.value_mut();
            if timer.cancel_pending(self.inner.next_generation()) {
                pending.push((document_id, timer.user_id));
            }
            if let Some(handle) = timer.in_flight.take() {
                in_flight.push(handle);
            }
        }

        let mut report = ShutdownReport {
            pending: pending.len(),
            ..ShutdownReport::default()
        };
        log::info!(
            "Flushing {} pending auto-save(s), {} in flight",
            pending.len(),
            in_flight.len()
        );

        let work = async {
            let results = join_all(
                pending
                    .iter()
                    .map(|(document_id, user_id)| self.flush_now(*document_id, *user_id)),
            )
            .await;
            for handle in in_flight {
                let _ = handle.await;
            }
            results
        };

        match tokio::time::timeout(deadline, work).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(AutoSaveOutcome::Saved(_)) => report.saved += 1,
                        Ok(AutoSaveOutcome::Unchanged) => report.unchanged += 1,
                        Err(_) => report.failed += 1,
                    }
                }
            }
            Err(_) => {
                log::warn!("Auto-save flush did not finish within {deadline:?}");
                report.timed_out = true;
            }
        }
        report
    }

    pub fn state(&self, document_id: DocumentId) -> AutoSaveState {
        self.inner
            .timers
            .get(&document_id)
            .map_or(AutoSaveState::Idle, |timer| timer.state)
    }

    /// When the pending timer for a document was (re)started.
    pub fn scheduled_at(&self, document_id: DocumentId) -> Option<Instant> {
        self.inner
            .timers
            .get(&document_id)
            .and_then(|timer| timer.scheduled_at)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Documents with a pending timer or a running save.
    pub fn tracked_documents(&self) -> usize {
        self.inner.timers.len()
    }

    pub fn stats(&self) -> AutoSaveStats {
        let stats = &self.inner.stats;
        AutoSaveStats {
            attempted: stats.attempted.load(Ordering::Relaxed),
            written: stats.written.load(Ordering::Relaxed),
            skipped_unchanged: stats.skipped_unchanged.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
        }
    }

    async fn fire(inner: Arc<Inner>, document_id: DocumentId, generation: u64) {
        let user_id = {
            let Some(mut timer) = inner.timers.get_mut(&document_id) else {
                return;
            };
            if timer.generation != generation || timer.state != AutoSaveState::Scheduled {
                log::trace!("Stale auto-save timer for document {document_id} ignored");
                return;
            }
            timer.state = AutoSaveState::Saving;
            timer.saving_generation = generation;
            timer.in_flight = timer.pending.take();
            timer.user_id
        };

        let _guard = SavingGuard {
            inner: inner.clone(),
            document_id,
            generation,
        };
        // Failures are counted and logged inside; the next edit reschedules.
        let _ = Self::save(&inner, document_id, user_id).await;
    }

    async fn save(inner: &Inner, document_id: DocumentId, user_id: UserId) -> Result<AutoSaveOutcome> {
        inner.stats.attempted.fetch_add(1, Ordering::Relaxed);

        let result = Self::save_if_changed(inner, document_id, user_id).await;
        match &result {
            Ok(AutoSaveOutcome::Saved(version)) => {
                inner.stats.written.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Auto-saved document {document_id} as version {}",
                    version.version_number
                );
            }
            Ok(AutoSaveOutcome::Unchanged) => {
                inner.stats.skipped_unchanged.fetch_add(1, Ordering::Relaxed);
                log::debug!("Auto-save of document {document_id} skipped: unchanged");
            }
            Err(e) => {
                inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Auto-save of document {document_id} failed: {e}");
            }
        }
        result
    }

    async fn save_if_changed(
        inner: &Inner,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<AutoSaveOutcome> {
        let current = inner.versions.current_state(document_id).await?;
        let latest = inner.versions.latest_snapshot(document_id).await?;

        if latest.is_some_and(|snapshot| snapshot.state == current) {
            return Ok(AutoSaveOutcome::Unchanged);
        }

        let version = inner
            .versions
            .create_auto_save(document_id, user_id, current)
            .await?;
        Ok(AutoSaveOutcome::Saved(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VersionConfig;
    use crate::storage::{MemoryDocumentStore, MemorySnapshotStore, SnapshotStore};
    use crate::versions::SnapshotKind;
    use logos_core::{DocumentState, Layer};
    use uuid::Uuid;

    const DEBOUNCE: Duration = Duration::from_secs(30);

    struct Fixture {
        documents: Arc<MemoryDocumentStore>,
        snapshots: Arc<MemorySnapshotStore>,
        scheduler: AutoSaveScheduler,
        doc: DocumentId,
        user: UserId,
    }

    fn fixture() -> Fixture {
        let documents = Arc::new(MemoryDocumentStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let doc = Uuid::new_v4();
        documents.insert(doc, DocumentState::new("Jacket").with_layer(Layer::new("body", "Body")));
        let versions = Arc::new(VersionController::new(
            documents.clone(),
            snapshots.clone(),
            VersionConfig::default(),
        ));
        let scheduler = AutoSaveScheduler::new(
            versions,
            AutoSaveConfig {
                debounce: DEBOUNCE,
                shutdown_deadline: Duration::from_secs(10),
            },
        );
        Fixture {
            documents,
            snapshots,
            scheduler,
            doc,
            user: Uuid::new_v4(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_saves_once_after_last_call() {
        let f = fixture();
        for _ in 0..5 {
            f.scheduler.schedule(f.doc, f.user);
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        // Last call at t=1.6s; nothing may fire before t=31.6s.
        assert_eq!(f.scheduler.state(f.doc), AutoSaveState::Scheduled);
        tokio::time::sleep(Duration::from_millis(29_500)).await;
        assert_eq!(f.scheduler.stats().attempted, 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = f.scheduler.stats();
        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(f.scheduler.state(f.doc), AutoSaveState::Idle);

        let latest = f.snapshots.latest(f.doc).await.unwrap().unwrap();
        assert_eq!(latest.version.kind, SnapshotKind::AutoSave);
        assert_eq!(latest.version.created_by, f.user);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_state_is_not_saved() {
        let f = fixture();
        f.scheduler.schedule(f.doc, f.user);
        tokio::time::sleep(DEBOUNCE + Duration::from_secs(1)).await;
        assert_eq!(f.snapshots.count(f.doc), 1);

        f.scheduler.schedule(f.doc, f.user);
        tokio::time::sleep(DEBOUNCE + Duration::from_secs(1)).await;
        assert_eq!(f.snapshots.count(f.doc), 1);
        assert_eq!(f.scheduler.stats().skipped_unchanged, 1);

        f.documents
            .update(f.doc, |s| s.metadata.name = "Renamed".into())
            .unwrap();
        f.scheduler.schedule(f.doc, f.user);
        tokio::time::sleep(DEBOUNCE + Duration::from_secs(1)).await;
        assert_eq!(f.snapshots.count(f.doc), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_save() {
        let f = fixture();
        f.scheduler.schedule(f.doc, f.user);
        assert!(f.scheduler.cancel(f.doc));
        assert!(!f.scheduler.cancel(f.doc));
        assert_eq!(f.scheduler.state(f.doc), AutoSaveState::Idle);

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(f.scheduler.stats().attempted, 0);
        assert_eq!(f.snapshots.count(f.doc), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_documents_are_forgotten() {
        let f = fixture();
        let others: Vec<DocumentId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for doc in &others {
            f.documents.insert(*doc, DocumentState::new("Scarf"));
            f.scheduler.schedule(*doc, f.user);
        }
        f.scheduler.schedule(f.doc, f.user);
        assert_eq!(f.scheduler.tracked_documents(), 4);

        f.scheduler.cancel(f.doc);
        assert_eq!(f.scheduler.tracked_documents(), 3);

        tokio::time::sleep(DEBOUNCE + Duration::from_secs(1)).await;
        assert_eq!(f.scheduler.stats().written, 3);
        assert_eq!(f.scheduler.tracked_documents(), 0);

        // A document seen again starts a fresh debounce window.
        f.scheduler.schedule(others[0], f.user);
        assert_eq!(f.scheduler.state(others[0]), AutoSaveState::Scheduled);
        tokio::time::sleep(DEBOUNCE - Duration::from_secs(1)).await;
        assert_eq!(f.scheduler.stats().attempted, 3);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.scheduler.stats().attempted, 4);
        assert_eq!(f.scheduler.tracked_documents(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_save_still_returns_to_idle() {
        let f = fixture();
        f.documents.set_yielding(true);
        let scheduler = f.scheduler.clone();
        let (doc, user) = (f.doc, f.user);
        let flush = tokio::spawn(async move { scheduler.flush_now(doc, user).await });
        tokio::task::yield_now().await;
        assert_eq!(f.scheduler.state(f.doc), AutoSaveState::Saving);

        assert!(!f.scheduler.cancel(f.doc));
        flush.await.unwrap().unwrap();
        assert_eq!(f.scheduler.state(f.doc), AutoSaveState::Idle);
        assert_eq!(f.scheduler.tracked_documents(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_returns_to_idle() {
        let f = fixture();
        f.snapshots.set_failing(true);
        f.scheduler.schedule(f.doc, f.user);
        tokio::time::sleep(DEBOUNCE + Duration::from_secs(1)).await;

        assert_eq!(f.scheduler.stats().failed, 1);
        assert_eq!(f.scheduler.state(f.doc), AutoSaveState::Idle);

        // The next edit reschedules normally.
        f.snapshots.set_failing(false);
        assert!(f.scheduler.schedule(f.doc, f.user));
        tokio::time::sleep(DEBOUNCE + Duration::from_secs(1)).await;
        assert_eq!(f.scheduler.stats().written, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_replaces_timer() {
        let f = fixture();
        f.scheduler.schedule(f.doc, f.user);
        let outcome = f.scheduler.flush_now(f.doc, f.user).await.unwrap();
        assert!(matches!(outcome, AutoSaveOutcome::Saved(ref v) if v.version_number == 1));
        assert_eq!(f.scheduler.state(f.doc), AutoSaveState::Idle);

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(f.scheduler.stats().attempted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending() {
        let f = fixture();
        let other = Uuid::new_v4();
        f.documents.insert(other, DocumentState::new("Skirt"));
        f.scheduler.schedule(f.doc, f.user);
        f.scheduler.schedule(other, f.user);

        let report = f.scheduler.shutdown_flush_all(Duration::from_secs(5)).await;
        assert_eq!(report.pending, 2);
        assert_eq!(report.saved, 2);
        assert!(!report.timed_out);
        assert!(f.scheduler.is_closed());
        assert!(!f.scheduler.schedule(f.doc, f.user));
        assert_eq!(f.snapshots.count(other), 1);
    }
}
