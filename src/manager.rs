//! Session lifecycle orchestration.
//!
//! The [`SessionManager`] ties the store, validation pipeline,
//! persistence decider, and broadcast router together, one method per
//! connection event: start, fix, pause/resume, stop, disconnect, and the
//! operator kill switch. It owns no transport concerns; the WebSocket
//! layer in [`crate::server`] translates wire messages into these calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::persist::{should_persist, PersistHandle, PersistJob};
use crate::protocol::ServerMessage;
use crate::session::{
    ConnectionId, LocationFix, SessionSnapshot, SessionState, SessionStore, StartOutcome,
    StoreError, Thresholds,
};
use crate::validate::{RejectReason, ValidationPipeline, Verdict};
use crate::watch::{BroadcastRouter, WatcherRegistry};

/// Server clock, epoch milliseconds. The single source of truth for
/// liveness and interval decisions (client clocks are used only for
/// ordering).
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What happened to one incoming fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixOutcome {
    Accepted {
        /// A durable write was queued for this fix.
        queued_persist: bool,
        /// Accepted despite client/server clock disagreement.
        clock_skewed: bool,
    },
    Rejected(RejectReason),
    /// No session for the subject: a warning no-op, recoverable by the
    /// client issuing `start` again.
    NoSession,
}

/// Session snapshot plus derived liveness, for operator listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionOverview {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    /// No accepted fix within the configured staleness horizon.
    pub stale: bool,
}

/// Orchestrates session state per connection event and exposes the
/// remote kill switch. Cheap to clone; all fields are shared handles.
#[derive(Clone)]
pub struct SessionManager {
    sessions: SessionStore,
    watchers: WatcherRegistry,
    router: BroadcastRouter,
    persist: PersistHandle,
    validator: ValidationPipeline,
    default_thresholds: Thresholds,
    stale_after_ms: u64,
    /// Outbound channel per live connection, for unicast commands
    /// (currently only the kill switch).
    connections: Arc<RwLock<HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>>,
}

impl SessionManager {
    pub fn new(
        sessions: SessionStore,
        watchers: WatcherRegistry,
        router: BroadcastRouter,
        persist: PersistHandle,
        validator: ValidationPipeline,
        default_thresholds: Thresholds,
        stale_after_ms: u64,
    ) -> Self {
        Self {
            sessions,
            watchers,
            router,
            persist,
            validator,
            default_thresholds,
            stale_after_ms,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// A connection passed credential verification; register its outbound
    /// channel so the server can unicast commands to it.
    pub fn register_connection(&self, conn: ConnectionId, tx: mpsc::Sender<ServerMessage>) {
        self.connections.write().insert(conn, tx);
    }

    /// Transport-level disconnect. Drops routing state only: the
    /// subject's session survives so a reconnecting device resumes
    /// without losing adaptive thresholds or its persistence anchor.
    pub fn handle_disconnect(&self, conn: ConnectionId) {
        self.connections.write().remove(&conn);
        self.watchers.remove_connection(conn);
    }

    /// `start` event: create or resume the subject's session (idempotent).
    pub fn start(
        &self,
        subject: &str,
        conn: ConnectionId,
        requested: Option<Thresholds>,
    ) -> StartOutcome {
        let outcome = self
            .sessions
            .start(subject, conn, requested, self.default_thresholds);
        tracing::info!(
            subject,
            resumed = outcome.resumed,
            "tracking session started"
        );
        outcome
    }

    /// `fix` event at the current server time.
    pub fn fix(&self, subject: &str, fix: LocationFix) -> FixOutcome {
        self.fix_at(subject, fix, epoch_ms())
    }

    /// `fix` event with an explicit server clock (tests drive this).
    ///
    /// Validation, the persistence decision, and the watermark advance
    /// happen in one pass through the subject's critical section, so two
    /// racing deliveries of the same fix cannot both be accepted. The
    /// broadcast and the durable-write hand-off happen after the lock is
    /// released; neither blocks ingestion.
    pub fn fix_at(&self, subject: &str, fix: LocationFix, server_now_ms: u64) -> FixOutcome {
        let step = self.sessions.with_session(subject, |session| {
            match self.validator.validate(session, &fix, server_now_ms) {
                Verdict::Accept { clock_skewed } => {
                    let persist = should_persist(
                        session.last_persisted.as_ref(),
                        &fix,
                        &session.thresholds,
                        server_now_ms,
                    );
                    session.note_accepted(&fix, server_now_ms);
                    Ok((persist, clock_skewed))
                }
                Verdict::Reject(reason) => Err(reason),
            }
        });

        match step {
            None => {
                tracing::warn!(subject, "fix for unknown session; client must start first");
                FixOutcome::NoSession
            }
            Some(Err(reason)) => {
                tracing::debug!(subject, reason = %reason, "fix rejected");
                FixOutcome::Rejected(reason)
            }
            Some(Ok((persist, clock_skewed))) => {
                // Every accepted fix reaches watchers, durable or not.
                self.router.broadcast_visual(subject, &fix);
                let queued_persist = persist
                    && self.persist.enqueue(PersistJob {
                        subject: subject.to_string(),
                        fix,
                        server_now_ms,
                    });
                FixOutcome::Accepted {
                    queued_persist,
                    clock_skewed,
                }
            }
        }
    }

    /// `pause` event: fixes are rejected until resume, session retained.
    pub fn pause(&self, subject: &str) -> Result<(), StoreError> {
        self.sessions.set_state(subject, SessionState::Paused)?;
        tracing::info!(subject, "session paused");
        Ok(())
    }

    /// `resume` event.
    pub fn resume(&self, subject: &str) -> Result<(), StoreError> {
        self.sessions.set_state(subject, SessionState::Active)?;
        tracing::info!(subject, "session resumed");
        Ok(())
    }

    /// `stop` event: terminal, removes the session. Subsequent fixes are
    /// treated as unknown-session until an explicit `start`.
    pub fn stop(&self, subject: &str) -> Result<(), StoreError> {
        self.sessions.stop(subject)?;
        tracing::info!(subject, "session stopped");
        Ok(())
    }

    /// Kill switch: force the subject's session to stop and command the
    /// device's current connection to cease sending fixes, independent
    /// of which connection issued the command.
    pub async fn force_stop(&self, subject: &str, reason: &str) -> Result<(), StoreError> {
        let session = self.sessions.stop(subject)?;
        tracing::warn!(subject, reason, "session force-stopped by operator");

        let tx = self.connections.read().get(&session.connection_id).cloned();
        if let Some(tx) = tx {
            // Best effort; a dead connection has nothing left to stop.
            let _ = tx
                .send(ServerMessage::ForceStop {
                    reason: reason.to_string(),
                })
                .await;
        }
        Ok(())
    }

    /// Watcher join protocol: subscribe `conn` to one subject or to all.
    /// Returns false if the connection is not registered.
    pub fn watch(&self, conn: ConnectionId, subject: Option<&str>) -> bool {
        let Some(tx) = self.connections.read().get(&conn).cloned() else {
            return false;
        };
        match subject {
            Some(subject) => self.watchers.watch_subject(subject, conn, tx),
            None => self.watchers.watch_all(conn, tx),
        }
        true
    }

    /// Server-side threshold retuning for a live session.
    pub fn retune(&self, subject: &str, thresholds: Thresholds) -> Result<(), StoreError> {
        self.sessions.retune(subject, thresholds)?;
        tracing::info!(subject, "session thresholds retuned");
        Ok(())
    }

    /// Operator listing with derived staleness.
    pub fn list_sessions(&self) -> Vec<SessionOverview> {
        let now = epoch_ms();
        self.sessions
            .list()
            .into_iter()
            .map(|snapshot| {
                let stale = snapshot.last_server_seen_at == 0
                    || now.saturating_sub(snapshot.last_server_seen_at) > self.stale_after_ms;
                SessionOverview { snapshot, stale }
            })
            .collect()
    }
}
