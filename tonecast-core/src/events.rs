//! Serialisable session status and outcome types.
//!
//! `SessionStatusEvent`s are broadcast while a call runs; `SessionOutcome` is
//! what `Session::play` returns. Both serialise to camelCase JSON for hosts
//! that forward them over IPC or print them.

use serde::{Deserialize, Serialize};

use crate::{session::playback::DiagnosticsSnapshot, synthesis::SynthesisFault};

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted on the session's status channel whenever the phase changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// Created, `play` not called yet.
    Idle,
    /// Audio is being synthesized and paced out.
    Speaking,
    /// Playback is over; waiting for caller digits.
    CollectingDigits,
    /// The call finished (completed or hung up).
    Finished,
    /// Setup failed or an internal fault aborted the call.
    Failed,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How the call ended from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallResult {
    /// Playback ran to completion or was interrupted by a digit.
    Completed,
    /// The far end hung up; an early exit, not an error.
    Hangup,
}

/// Result of one `Session::play` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    pub result: CallResult,
    /// Published digit string; `None` when nothing was published.
    pub digits: Option<String>,
    /// Extension the call was routed to, if any.
    pub routed_extension: Option<String>,
    /// Engine error that ended audio early, if any.
    pub synthesis_fault: Option<SynthesisFault>,
    pub diagnostics: DiagnosticsSnapshot,
}

impl SessionOutcome {
    pub fn hung_up(&self) -> bool {
        self.result == CallResult::Hangup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_camel_case_status() {
        let event = SessionStatusEvent {
            status: SessionStatus::CollectingDigits,
            detail: Some("after playback".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "collectingDigits");
        assert_eq!(json["detail"], "after playback");

        let round_trip: SessionStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, SessionStatus::CollectingDigits);
    }

    #[test]
    fn outcome_serializes_with_camel_case_fields() {
        let outcome = SessionOutcome {
            result: CallResult::Completed,
            digits: Some("1234".into()),
            routed_extension: Some("1234".into()),
            synthesis_fault: Some(SynthesisFault::PortUnavailable),
            diagnostics: DiagnosticsSnapshot {
                frames_emitted: 3,
                bytes_emitted: 480,
                ..DiagnosticsSnapshot::default()
            },
        };

        let json = serde_json::to_value(&outcome).expect("serialize outcome");
        assert_eq!(json["result"], "completed");
        assert_eq!(json["digits"], "1234");
        assert_eq!(json["routedExtension"], "1234");
        assert_eq!(json["synthesisFault"]["kind"], "portUnavailable");
        assert_eq!(json["diagnostics"]["framesEmitted"], 3);
        assert_eq!(json["diagnostics"]["bytesEmitted"], 480);

        let round_trip: SessionOutcome =
            serde_json::from_value(json).expect("deserialize outcome");
        assert_eq!(round_trip.result, CallResult::Completed);
        assert_eq!(round_trip.diagnostics.frames_emitted, 3);
        assert!(!round_trip.hung_up());
    }

    #[test]
    fn call_result_rejects_unknown_values() {
        assert!(serde_json::from_str::<CallResult>(r#""Hangup""#).is_err());
        assert_eq!(
            serde_json::from_str::<CallResult>(r#""hangup""#).unwrap(),
            CallResult::Hangup
        );
    }
}
