//! The error taxonomy shared across component boundaries.
//!
//! Each component defines its own `thiserror` enum for the errors it can
//! return directly (see `operon-core`), but [`ErrorKind`] is the common
//! vocabulary used wherever an error needs to be recorded onto an
//! `Operation` or `StepResult` for later inspection via `getStatus`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminated error kinds an operation or step can accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ResourceUnavailable,
    StepTimeout,
    StepCancelled,
    StepFatal,
    StepRetryable,
    Deadlock,
    StateConflict,
    CompensationError,
    SystemShutdown,
}

impl ErrorKind {
    /// Whether an error of this kind may still resolve to a non-terminal
    /// outcome (i.e. the caller should not treat it as final yet).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::StepRetryable)
    }
}

/// A single recorded error, attached to an `Operation` or `StepResult` for
/// the user-visible error list `getStatus` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl RecordedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), occurred_at: Utc::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_retryable_is_recoverable() {
        assert!(ErrorKind::StepRetryable.is_recoverable());
        assert!(!ErrorKind::StepFatal.is_recoverable());
        assert!(!ErrorKind::Deadlock.is_recoverable());
    }

    #[test]
    fn recorded_error_serde_roundtrip() {
        let err = RecordedError::new(ErrorKind::StepTimeout, "deadline exceeded");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"step_timeout\""));
        let parsed: RecordedError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, ErrorKind::StepTimeout);
    }
}
