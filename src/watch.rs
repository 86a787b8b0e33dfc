//! Watcher registry and broadcast fan-out.
//!
//! A *watcher* is a connection subscribed to live updates about one
//! subject or all subjects. Membership is pure in-memory routing state,
//! rebuilt when a watcher reconnects. Fan-out is best-effort and
//! fire-and-forget: a slow or dead watcher never blocks the ingestion
//! path or delivery to other watchers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;
use crate::session::{ConnectionId, LocationFix, SubjectId};

#[derive(Default)]
struct RegistryInner {
    /// Watchers of the "all subjects" audience.
    all: HashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
    /// Watchers of one specific subject.
    by_subject: HashMap<SubjectId, HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>,
}

/// Explicit subject→watchers routing table (many-to-many).
#[derive(Clone, Default)]
pub struct WatcherRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the "all subjects" audience.
    pub fn watch_all(&self, conn: ConnectionId, tx: mpsc::Sender<ServerMessage>) {
        self.inner.write().all.insert(conn, tx);
    }

    /// Join one subject's audience. Additive with other subscriptions.
    pub fn watch_subject(
        &self,
        subject: &str,
        conn: ConnectionId,
        tx: mpsc::Sender<ServerMessage>,
    ) {
        self.inner
            .write()
            .by_subject
            .entry(subject.to_string())
            .or_default()
            .insert(conn, tx);
    }

    /// Drop every subscription held by `conn` (on disconnect).
    pub fn remove_connection(&self, conn: ConnectionId) {
        let mut inner = self.inner.write();
        inner.all.remove(&conn);
        inner.by_subject.retain(|_, watchers| {
            watchers.remove(&conn);
            !watchers.is_empty()
        });
    }

    /// Senders that should receive updates about `subject`, deduplicated:
    /// a connection watching both the global audience and this subject
    /// gets one copy.
    fn audience(&self, subject: &str) -> Vec<mpsc::Sender<ServerMessage>> {
        let inner = self.inner.read();
        let mut targets: HashMap<ConnectionId, mpsc::Sender<ServerMessage>> = inner
            .all
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        if let Some(watchers) = inner.by_subject.get(subject) {
            for (id, tx) in watchers {
                targets.entry(*id).or_insert_with(|| tx.clone());
            }
        }
        targets.into_values().collect()
    }

    #[cfg(test)]
    fn audience_size(&self, subject: &str) -> usize {
        self.audience(subject).len()
    }
}

/// Fan-out of accepted fixes to interested watchers, decoupled from
/// persistence. Side effect only: no return value, no state beyond the
/// registry it routes through.
#[derive(Clone)]
pub struct BroadcastRouter {
    watchers: WatcherRegistry,
}

impl BroadcastRouter {
    pub fn new(watchers: WatcherRegistry) -> Self {
        Self { watchers }
    }

    pub fn registry(&self) -> &WatcherRegistry {
        &self.watchers
    }

    /// Relay an accepted fix to the dashboard and per-subject audiences,
    /// tagged as a transient visual update. Called for *every* accepted
    /// fix, durable or not.
    pub fn broadcast_visual(&self, subject: &str, fix: &LocationFix) {
        self.fan_out(
            subject,
            ServerMessage::VisualUpdate {
                subject: subject.to_string(),
                fix: fix.clone(),
            },
        );
    }

    /// Relay a fix that was durably stored, tagged as a confirmed
    /// waypoint. Called only after the storage collaborator succeeded.
    pub fn broadcast_persisted(&self, subject: &str, fix: &LocationFix) {
        self.fan_out(
            subject,
            ServerMessage::PersistedUpdate {
                subject: subject.to_string(),
                fix: fix.clone(),
            },
        );
    }

    fn fan_out(&self, subject: &str, msg: ServerMessage) {
        for tx in self.watchers.audience(subject) {
            match tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow watcher: drop this update for it, never wait.
                    tracing::debug!(subject, "watcher buffer full, dropping update");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Stale entry; the disconnect path will clean it up.
                    tracing::trace!(subject, "watcher channel closed");
                }
            }
        }
    }
}
