//! Call lifecycle model.
//!
//! A call is created implicitly by its first packet and driven through
//! IN_PROGRESS -> COMPLETED -> PROCESSING_AI -> ARCHIVED | FAILED.
//! ARCHIVED and FAILED are terminal; every other transition is rejected.
//! All transitions happen inside the engine's per-call lock, so state
//! checks and updates are atomic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a call.
///
/// Serialized as the literal wire strings (`"IN_PROGRESS"`, `"PROCESSING_AI"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    InProgress,
    Completed,
    ProcessingAi,
    Archived,
    Failed,
}

impl CallState {
    /// ARCHIVED and FAILED accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Archived | CallState::Failed)
    }

    /// True once the completion signal has been applied (COMPLETED or later).
    pub fn is_past_completion(self) -> bool {
        !matches!(self, CallState::InProgress)
    }

    /// The transition graph. Anything not listed here is invalid.
    pub fn can_transition(self, to: CallState) -> bool {
        matches!(
            (self, to),
            (CallState::InProgress, CallState::Completed)
                | (CallState::Completed, CallState::ProcessingAi)
                | (CallState::ProcessingAi, CallState::Archived)
                | (CallState::ProcessingAi, CallState::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::InProgress => "IN_PROGRESS",
            CallState::Completed => "COMPLETED",
            CallState::ProcessingAi => "PROCESSING_AI",
            CallState::Archived => "ARCHIVED",
            CallState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<CallState> {
        match s {
            "IN_PROGRESS" => Some(CallState::InProgress),
            "COMPLETED" => Some(CallState::Completed),
            "PROCESSING_AI" => Some(CallState::ProcessingAi),
            "ARCHIVED" => Some(CallState::Archived),
            "FAILED" => Some(CallState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted a transition the lifecycle graph does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub to: CallState,
}

/// One call row. Mutated only by the engine, only under its per-call lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub state: CallState,
    /// Count of distinct accepted sequence numbers (== stored packet rows).
    pub received_count: u64,
    /// Set by the completion signal; never changed afterwards.
    pub expected_total: Option<u64>,
    /// Lowest sequence not yet accepted and not yet known to be missing.
    /// Monotonically non-decreasing.
    pub expected_next: u64,
    /// Sequences below `expected_next` not yet received, capped at
    /// [`crate::sequence::MISSING_CAP`] elements.
    pub missing: BTreeSet<u64>,
    /// Set once the cap forced us to stop recording missing sequences.
    pub missing_truncated: bool,
    pub transcription: Option<String>,
    pub sentiment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn new(call_id: &str) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.to_string(),
            state: CallState::InProgress,
            received_count: 0,
            expected_total: None,
            expected_next: 0,
            missing: BTreeSet::new(),
            missing_truncated: false,
            transcription: None,
            sentiment: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle transition, returning the previous state.
    pub fn transition(&mut self, to: CallState) -> Result<CallState, InvalidTransition> {
        if !self.state.can_transition(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        self.updated_at = Utc::now();
        Ok(from)
    }

    /// Missing sequences as an ascending vec, the shape events and responses use.
    pub fn missing_sequences(&self) -> Vec<u64> {
        self.missing.iter().copied().collect()
    }
}

/// One accepted packet row. `(call_id, sequence)` is unique in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    pub call_id: String,
    pub sequence: u64,
    pub data: String,
    /// PBX-supplied capture timestamp (seconds, positive).
    pub timestamp: f64,
    pub received_at: DateTime<Utc>,
}

impl PacketRecord {
    pub fn new(call_id: &str, sequence: u64, data: String, timestamp: f64) -> Self {
        Self {
            call_id: call_id.to_string(),
            sequence,
            data,
            timestamp,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut call = CallRecord::new("c1");
        assert_eq!(call.state, CallState::InProgress);
        assert_eq!(call.transition(CallState::Completed).unwrap(), CallState::InProgress);
        assert_eq!(call.transition(CallState::ProcessingAi).unwrap(), CallState::Completed);
        assert_eq!(call.transition(CallState::Archived).unwrap(), CallState::ProcessingAi);
        assert!(call.state.is_terminal());
    }

    #[test]
    fn failure_path_transitions() {
        let mut call = CallRecord::new("c1");
        call.transition(CallState::Completed).unwrap();
        call.transition(CallState::ProcessingAi).unwrap();
        call.transition(CallState::Failed).unwrap();
        assert!(call.state.is_terminal());
    }

    #[test]
    fn illegal_transitions_rejected() {
        let cases = [
            (CallState::InProgress, CallState::ProcessingAi),
            (CallState::InProgress, CallState::Archived),
            (CallState::InProgress, CallState::Failed),
            (CallState::Completed, CallState::Archived),
            (CallState::Completed, CallState::Failed),
            (CallState::Completed, CallState::InProgress),
            (CallState::Archived, CallState::Failed),
            (CallState::Failed, CallState::Archived),
            (CallState::ProcessingAi, CallState::Completed),
        ];
        for (from, to) in cases {
            assert!(!from.can_transition(to), "{from} -> {to} should be invalid");
        }

        let mut call = CallRecord::new("c1");
        let err = call.transition(CallState::Archived).unwrap_err();
        assert_eq!(err.from, CallState::InProgress);
        assert_eq!(err.to, CallState::Archived);
        // A failed transition leaves the state untouched.
        assert_eq!(call.state, CallState::InProgress);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [CallState::Archived, CallState::Failed] {
            for to in [
                CallState::InProgress,
                CallState::Completed,
                CallState::ProcessingAi,
                CallState::Archived,
                CallState::Failed,
            ] {
                assert!(!terminal.can_transition(to));
            }
        }
    }

    #[test]
    fn state_serializes_to_wire_strings() {
        assert_eq!(
            serde_json::to_value(CallState::ProcessingAi).unwrap(),
            serde_json::json!("PROCESSING_AI")
        );
        assert_eq!(
            serde_json::to_value(CallState::InProgress).unwrap(),
            serde_json::json!("IN_PROGRESS")
        );
        assert_eq!(CallState::parse("ARCHIVED"), Some(CallState::Archived));
        assert_eq!(CallState::parse("archived"), None);
        for state in [
            CallState::InProgress,
            CallState::Completed,
            CallState::ProcessingAi,
            CallState::Archived,
            CallState::Failed,
        ] {
            assert_eq!(CallState::parse(state.as_str()), Some(state));
        }
    }
}
