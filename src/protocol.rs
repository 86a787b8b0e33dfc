//! Logical message types for the tracking session protocol.
//!
//! Messages are JSON objects tagged by a `type` field and are carried over
//! any message-oriented duplex channel; the shipped transport is WebSocket
//! text frames (see [`crate::server`]). Nothing in here assumes a
//! particular framing.

use serde::{Deserialize, Serialize};

use crate::session::{LocationFix, SubjectId, Thresholds};
use crate::validate::RejectReason;

/// Client → server messages.
///
/// A connection must send `auth` first; every other message is ignored
/// with an error until credential verification succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present a credential. Must be the first message on the connection.
    Auth { token: String },
    /// Begin (or resume) tracking for the authenticated subject.
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thresholds: Option<Thresholds>,
    },
    /// One position report. Payload is the [`LocationFix`] fields inline.
    Fix {
        #[serde(flatten)]
        fix: LocationFix,
    },
    Pause,
    Resume,
    /// End tracking and discard the session.
    Stop,
    /// Join a watcher audience: a specific subject, or all subjects when
    /// `subject` is omitted. Multiple declarations are additive.
    Watch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<SubjectId>,
    },
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Credential accepted; the connection now acts for `subject`.
    Authed { subject: SubjectId },
    /// Tracking started (or resumed) with the effective thresholds.
    Started {
        subject: SubjectId,
        resumed: bool,
        thresholds: Thresholds,
    },
    /// A fix failed validation. Diagnostic only; the session continues.
    Rejected {
        reason: RejectReason,
        client_timestamp: u64,
    },
    Paused { subject: SubjectId },
    Resumed { subject: SubjectId },
    Stopped { subject: SubjectId },
    /// Watcher push: an accepted fix, relayed for live-map smoothness.
    /// Not necessarily durable.
    VisualUpdate {
        subject: SubjectId,
        #[serde(flatten)]
        fix: LocationFix,
    },
    /// Watcher push: a fix that was also written to durable storage, a
    /// confirmed waypoint.
    PersistedUpdate {
        subject: SubjectId,
        #[serde(flatten)]
        fix: LocationFix,
    },
    /// Kill switch: the server commands this connection's subject to stop
    /// sending fixes. Terminal for the session.
    ForceStop { reason: String },
    /// Watcher join acknowledged.
    Watching {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<SubjectId>,
    },
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // ServerMessage contains no non-serializable state; encoding can
        // only fail on a malformed float, which the validation pipeline
        // has already excluded.
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(?e, "failed to encode server message");
            r#"{"type":"error","code":"internal_error","message":"encode failure"}"#.to_string()
        })
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
