//! Anti-abuse validation pipeline applied to every incoming fix.
//!
//! Stateless: all inputs come from the fix, the subject's current session,
//! and the server clock. Predicates run in a fixed order and the first
//! failure wins, so every rejected fix yields exactly one reason.

use serde::{Deserialize, Serialize};

use crate::session::{LocationFix, SessionState, TrackingSession};

/// Why a fix was rejected. Reasons are mutually exclusive: the pipeline
/// short-circuits on the first failing predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Session exists but is not `Active` (paused or stopping).
    SessionInactive,
    /// Coordinates missing, NaN, or the (0, 0) GPS-unavailable sentinel.
    DegenerateCoordinates,
    /// Client timestamp at or behind the session watermark: a duplicate or
    /// out-of-order delivery. Not an error: this is what makes ingestion
    /// idempotent under at-least-once delivery.
    StaleTimestamp,
    /// Reported accuracy radius exceeds the session's threshold.
    AccuracyExceeded,
    /// Reported ground speed exceeds the spoofing/GPS-jump cap.
    ImplausibleSpeed,
}

impl RejectReason {
    /// Machine-readable reason code, surfaced to the sending client.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::SessionInactive => "session_inactive",
            RejectReason::DegenerateCoordinates => "degenerate_coordinates",
            RejectReason::StaleTimestamp => "stale_timestamp",
            RejectReason::AccuracyExceeded => "accuracy_exceeded",
            RejectReason::ImplausibleSpeed => "implausible_speed",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of running the pipeline against one fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The fix is processed. `clock_skewed` is set when the client clock
    /// disagrees with the server clock beyond tolerance; such fixes are
    /// accepted with a warning rather than rejected (mobile clocks drift),
    /// and the timestamp is never silently corrected.
    Accept { clock_skewed: bool },
    Reject(RejectReason),
}

/// Stateless sequence of predicates applied to an incoming fix plus the
/// subject's current session.
#[derive(Debug, Clone, Copy)]
pub struct ValidationPipeline {
    clock_skew_tolerance_ms: u64,
    max_speed_mps: f64,
}

impl ValidationPipeline {
    pub fn new(clock_skew_tolerance_ms: u64, max_speed_mps: f64) -> Self {
        Self {
            clock_skew_tolerance_ms,
            max_speed_mps,
        }
    }

    /// Validate `fix` against `session`. Predicates run in this order,
    /// first failure wins:
    ///
    /// 1. session state (must be `Active`)
    /// 2. degenerate coordinates
    /// 3. clock skew (flag only, never rejects)
    /// 4. monotonicity / replay watermark
    /// 5. accuracy threshold
    /// 6. speed plausibility
    ///
    /// A rejecting verdict must not be accompanied by any session
    /// mutation; the caller advances watermarks only on `Accept`.
    pub fn validate(
        &self,
        session: &TrackingSession,
        fix: &LocationFix,
        server_now_ms: u64,
    ) -> Verdict {
        if session.state != SessionState::Active {
            return Verdict::Reject(RejectReason::SessionInactive);
        }

        if fix.coordinates().is_none() {
            return Verdict::Reject(RejectReason::DegenerateCoordinates);
        }

        let skew = server_now_ms.abs_diff(fix.client_timestamp);
        let clock_skewed = skew > self.clock_skew_tolerance_ms;
        if clock_skewed {
            tracing::warn!(
                subject = %session.subject_id,
                skew_ms = skew,
                client_timestamp = fix.client_timestamp,
                "fix client clock disagrees with server clock; accepting anyway"
            );
        }

        if fix.client_timestamp <= session.last_client_timestamp {
            return Verdict::Reject(RejectReason::StaleTimestamp);
        }

        if let Some(accuracy) = fix.accuracy_meters {
            if accuracy > session.thresholds.max_accuracy_meters {
                return Verdict::Reject(RejectReason::AccuracyExceeded);
            }
        }

        if let Some(speed) = fix.speed_mps {
            if speed > self.max_speed_mps {
                return Verdict::Reject(RejectReason::ImplausibleSpeed);
            }
        }

        Verdict::Accept { clock_skewed }
    }
}
