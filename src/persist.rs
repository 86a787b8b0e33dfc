//! Persistence decision policy and the durable-storage hand-off.
//!
//! The decider throttles durable writes: pure distance-based throttling
//! starves stationary agents of liveness records, pure time-based
//! throttling floods storage for fast movers, so a fix is persisted when
//! *either* threshold is exceeded. The actual write happens off the hot
//! path, through a bounded queue consumed by a worker task; only a
//! successful write advances the session's persistence anchor, so a
//! failed write self-heals once the next fix exceeds a threshold again.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::geo;
use crate::session::{LocationFix, PersistedAnchor, SessionStore, SubjectId, Thresholds};
use crate::watch::BroadcastRouter;

/// Durable storage failed to accept a fix. Logged, never fatal to the
/// session; the fix is dropped from persistence and not retried inline.
#[derive(Debug, thiserror::Error)]
#[error("storage backend error: {0}")]
pub struct StorageError(pub String);

/// Durable storage collaborator, consumed by the persistence worker.
///
/// `persist_fix` is called only for fixes the decider selected. The
/// returned future must be `'static` so implementations clone what they
/// need; the worker never holds a session lock while awaiting it.
pub trait FixStore: Send + Sync {
    fn persist_fix(
        &self,
        subject: SubjectId,
        fix: LocationFix,
    ) -> BoxFuture<'static, Result<(), StorageError>>;
}

/// Decide whether an accepted fix should be durably persisted now.
///
/// Persist when the fix moved farther than `min_distance_meters` from the
/// last persisted anchor, or when more than `min_interval_ms` of server
/// time has passed since that anchor. A session with no anchor yet always
/// persists its first accepted fix: `distance_meters` returns infinity
/// for degenerate anchors, and a missing anchor short-circuits to `true`.
pub fn should_persist(
    anchor: Option<&PersistedAnchor>,
    fix: &LocationFix,
    thresholds: &Thresholds,
    server_now_ms: u64,
) -> bool {
    let Some(anchor) = anchor else {
        return true;
    };
    let Some((lat, lon)) = fix.coordinates() else {
        // Validation rejects degenerate fixes before this point; treat a
        // stray one as not worth a durable write.
        return false;
    };

    let moved = geo::distance_meters(anchor.lat, anchor.lon, lat, lon);
    if moved > thresholds.min_distance_meters {
        return true;
    }

    server_now_ms.saturating_sub(anchor.at_ms) > thresholds.min_interval_ms
}

/// One queued durable write.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub subject: SubjectId,
    pub fix: LocationFix,
    /// Server time when the fix was accepted; becomes the anchor time.
    pub server_now_ms: u64,
}

/// Sending side of the persistence queue.
///
/// `enqueue` never blocks: when the queue is full the write is dropped
/// (with a warning) and the anchor stays put, so the next qualifying fix
/// retries the same comparison.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistJob>,
}

impl PersistHandle {
    /// Returns false if the job was dropped (queue full or worker gone).
    pub fn enqueue(&self, job: PersistJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(
                    subject = %job.subject,
                    "persistence queue full, dropping durable write"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::error!(subject = %job.subject, "persistence worker is gone");
                false
            }
        }
    }
}

/// Spawn the persistence worker.
///
/// The worker drains the queue, calls the storage collaborator, and only
/// on success records the new anchor and broadcasts the confirmed
/// waypoint. The session lock is re-acquired solely to record the
/// outcome, never held across the storage await.
pub fn spawn_persist_worker(
    store: Arc<dyn FixStore>,
    sessions: SessionStore,
    router: BroadcastRouter,
    queue_depth: usize,
) -> (PersistHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<PersistJob>(queue_depth);
    let handle = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let Some((lat, lon)) = job.fix.coordinates() else {
                continue;
            };
            match store.persist_fix(job.subject.clone(), job.fix.clone()).await {
                Ok(()) => {
                    sessions.record_persisted(&job.subject, lat, lon, job.server_now_ms);
                    router.broadcast_persisted(&job.subject, &job.fix);
                    tracing::debug!(subject = %job.subject, lat, lon, "fix persisted");
                }
                Err(e) => {
                    // Anchor untouched: the next fix is compared against
                    // the same anchor and will re-qualify.
                    tracing::warn!(subject = %job.subject, error = %e, "persist failed, dropping fix");
                }
            }
        }
        tracing::debug!("persistence worker exiting");
    });
    (PersistHandle { tx }, handle)
}

/// In-memory [`FixStore`], used by the standalone binary and tests.
/// A production deployment wires its own backend through the trait.
#[derive(Clone, Default)]
pub struct MemoryFixStore {
    rows: Arc<parking_lot::Mutex<Vec<(SubjectId, LocationFix)>>>,
}

impl MemoryFixStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> Vec<(SubjectId, LocationFix)> {
        self.rows.lock().clone()
    }
}

impl FixStore for MemoryFixStore {
    fn persist_fix(
        &self,
        subject: SubjectId,
        fix: LocationFix,
    ) -> BoxFuture<'static, Result<(), StorageError>> {
        let rows = self.rows.clone();
        Box::pin(async move {
            rows.lock().push((subject, fix));
            Ok(())
        })
    }
}
