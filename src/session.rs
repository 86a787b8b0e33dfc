//! Tracking session state and the concurrency-safe session store.
//!
//! A [`TrackingSession`] exists per tracked *subject*, not per connection:
//! a device that drops and reconnects resumes the same session, keeping its
//! adaptive thresholds and persistence anchor. The [`SessionStore`] is the
//! only shared-mutable-state component in the system and the sole
//! synchronization boundary.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a tracked agent (from credential verification).
pub type SubjectId = String;

/// Identity of one transport connection; changes across reconnects.
pub type ConnectionId = Uuid;

/// One reported position sample from a tracked device.
///
/// Ephemeral: a fix is either relayed to watchers, handed to durable
/// storage, or dropped. `lat`/`lon` are optional because devices report
/// GPS-unavailable as missing or zeroed coordinates; the validation
/// pipeline rejects those before any component relies on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f64>,
    /// Client clock, epoch milliseconds. Used strictly for ordering and
    /// replay detection, never for interval decisions.
    pub client_timestamp: u64,
}

impl LocationFix {
    /// The fix's coordinates, if they denote a usable position.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if !crate::geo::is_degenerate(lat, lon) => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Lifecycle state of a tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Paused,
    Stopped,
}

/// Adaptive persistence/validation thresholds, assigned at session start
/// and optionally retuned server-side while the session is live.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_distance_meters: f64,
    pub min_interval_ms: u64,
    pub max_accuracy_meters: f64,
}

impl Default for Thresholds {
    /// Untuned defaults. Accuracy is deliberately loose (100 m) for
    /// sessions that start without device-tuned thresholds; tuned sessions
    /// typically request ~30 m.
    fn default() -> Self {
        Self {
            min_distance_meters: 50.0,
            min_interval_ms: 30_000,
            max_accuracy_meters: 100.0,
        }
    }
}

/// The last fix that was durably stored for a session, used to compute
/// distance-since-last-save. `at_ms` is server clock time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistedAnchor {
    pub lat: f64,
    pub lon: f64,
    pub at_ms: u64,
}

/// Server-side tracked state for one subject's ongoing tracking activity.
#[derive(Debug, Clone)]
pub struct TrackingSession {
    pub subject_id: SubjectId,
    pub connection_id: ConnectionId,
    pub state: SessionState,
    /// Server clock time (epoch ms) of the last accepted fix. Liveness.
    pub last_server_seen_at: u64,
    /// Monotonic watermark from the client clock; rejects duplicates and
    /// out-of-order deliveries.
    pub last_client_timestamp: u64,
    pub last_persisted: Option<PersistedAnchor>,
    pub thresholds: Thresholds,
}

impl TrackingSession {
    /// Advance the liveness and ordering watermarks for an accepted fix.
    ///
    /// Must be called inside the per-subject critical section that also
    /// ran validation, so two racing fixes cannot both pass the
    /// monotonicity check.
    pub fn note_accepted(&mut self, fix: &LocationFix, server_now_ms: u64) {
        self.last_server_seen_at = server_now_ms;
        self.last_client_timestamp = fix.client_timestamp;
    }
}

/// Read-only view of a session for operator listings and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub subject_id: SubjectId,
    pub connection_id: ConnectionId,
    pub state: SessionState,
    pub last_server_seen_at: u64,
    pub last_client_timestamp: u64,
    pub last_persisted: Option<PersistedAnchor>,
    pub thresholds: Thresholds,
}

impl From<&TrackingSession> for SessionSnapshot {
    fn from(s: &TrackingSession) -> Self {
        Self {
            subject_id: s.subject_id.clone(),
            connection_id: s.connection_id,
            state: s.state,
            last_server_seen_at: s.last_server_seen_at,
            last_client_timestamp: s.last_client_timestamp,
            last_persisted: s.last_persisted,
            thresholds: s.thresholds,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no tracking session for subject: {0}")]
    SessionNotFound(String),
}

/// Outcome of [`SessionStore::start`].
#[derive(Debug, Clone)]
pub struct StartOutcome {
    /// True if an existing session was resumed rather than created.
    pub resumed: bool,
    pub thresholds: Thresholds,
}

/// Concurrency-safe registry mapping subject-id to session state.
///
/// Locking model: an outer `RwLock` guards the subject map; each entry is
/// an `Arc<Mutex<TrackingSession>>`. Lookups take the outer read lock only
/// long enough to clone the entry Arc, so operations on different subjects
/// never block each other. All mutation of one subject's session is
/// serialized through that subject's mutex; the same serialization point
/// is used by fix processing, pause/resume, and stop/force-stop, which is
/// what guarantees no fix is accepted after a stop is visible.
///
/// Lock order is always outer-then-inner; no code path holds the inner
/// mutex while acquiring the outer lock.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<SubjectId, Arc<Mutex<TrackingSession>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or resume the session for `subject` (idempotent per subject).
    ///
    /// A new session gets `requested` thresholds, falling back to
    /// `defaults` (the deployment's untuned values). Resuming updates the
    /// connection id and forces the state back to `Active`, but keeps the
    /// persistence anchor, watermark, and (unless the caller supplies
    /// new ones) the adaptive thresholds.
    pub fn start(
        &self,
        subject: &str,
        connection_id: ConnectionId,
        requested: Option<Thresholds>,
        defaults: Thresholds,
    ) -> StartOutcome {
        // Fast path: resume an existing entry under the read lock.
        if let Some(entry) = self.entry(subject) {
            return Self::resume(&entry, connection_id, requested);
        }

        let mut map = self.inner.write();
        // A concurrent start may have created the entry between the read
        // and write lock; resume it rather than clobbering its state.
        if let Some(entry) = map.get(subject).cloned() {
            return Self::resume(&entry, connection_id, requested);
        }

        let thresholds = requested.unwrap_or(defaults);
        let session = TrackingSession {
            subject_id: subject.to_string(),
            connection_id,
            state: SessionState::Active,
            last_server_seen_at: 0,
            last_client_timestamp: 0,
            last_persisted: None,
            thresholds,
        };
        map.insert(subject.to_string(), Arc::new(Mutex::new(session)));
        StartOutcome {
            resumed: false,
            thresholds,
        }
    }

    fn resume(
        entry: &Arc<Mutex<TrackingSession>>,
        connection_id: ConnectionId,
        thresholds: Option<Thresholds>,
    ) -> StartOutcome {
        let mut session = entry.lock();
        session.connection_id = connection_id;
        session.state = SessionState::Active;
        if let Some(t) = thresholds {
            session.thresholds = t;
        }
        StartOutcome {
            resumed: true,
            thresholds: session.thresholds,
        }
    }

    fn entry(&self, subject: &str) -> Option<Arc<Mutex<TrackingSession>>> {
        self.inner.read().get(subject).cloned()
    }

    /// Run `f` inside `subject`'s critical section.
    ///
    /// This is the linearization point for everything that touches one
    /// subject's session: the fix pipeline validates, decides persistence,
    /// and advances watermarks in a single call here.
    pub fn with_session<R>(
        &self,
        subject: &str,
        f: impl FnOnce(&mut TrackingSession) -> R,
    ) -> Option<R> {
        let entry = self.entry(subject)?;
        let mut session = entry.lock();
        Some(f(&mut session))
    }

    /// Record a successful durable write, advancing the persistence anchor.
    ///
    /// Called by the persistence worker after the storage collaborator
    /// succeeded, never before, so a failed write leaves the anchor
    /// unchanged and the next fix is evaluated against the same anchor.
    pub fn record_persisted(&self, subject: &str, lat: f64, lon: f64, at_ms: u64) {
        let updated = self.with_session(subject, |session| {
            session.last_persisted = Some(PersistedAnchor { lat, lon, at_ms });
        });
        if updated.is_none() {
            // Session stopped while the write was in flight; nothing to anchor.
            tracing::debug!(subject, "persisted fix for a session that no longer exists");
        }
    }

    /// Transition a session between `Active` and `Paused`.
    pub fn set_state(
        &self,
        subject: &str,
        state: SessionState,
    ) -> Result<SessionState, StoreError> {
        self.with_session(subject, |session| {
            session.state = state;
            session.state
        })
        .ok_or_else(|| StoreError::SessionNotFound(subject.to_string()))
    }

    /// Remove the session entirely, returning its final state.
    ///
    /// The state is set to `Stopped` under the subject mutex *before* the
    /// entry is dropped, so a fix task that already cloned the entry Arc
    /// observes `Stopped` and rejects rather than mutating ghost state.
    pub fn stop(&self, subject: &str) -> Result<TrackingSession, StoreError> {
        let entry = {
            let mut map = self.inner.write();
            map.remove(subject)
                .ok_or_else(|| StoreError::SessionNotFound(subject.to_string()))?
        };
        let mut session = entry.lock();
        session.state = SessionState::Stopped;
        Ok(session.clone())
    }

    /// Replace a live session's thresholds (server-side retuning).
    pub fn retune(&self, subject: &str, thresholds: Thresholds) -> Result<(), StoreError> {
        self.with_session(subject, |session| {
            session.thresholds = thresholds;
        })
        .ok_or_else(|| StoreError::SessionNotFound(subject.to_string()))
    }

    pub fn snapshot(&self, subject: &str) -> Option<SessionSnapshot> {
        self.with_session(subject, |session| SessionSnapshot::from(&*session))
    }

    /// Snapshots of all sessions, for the operator listing.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let entries: Vec<Arc<Mutex<TrackingSession>>> =
            self.inner.read().values().cloned().collect();
        entries
            .iter()
            .map(|e| SessionSnapshot::from(&*e.lock()))
            .collect()
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.inner.read().contains_key(subject)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
