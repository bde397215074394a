//! The outcome of running a single step to completion (or failure).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RecordedError;
use crate::ids::StepId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Compensated,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Compensated)
    }
}

/// What the Step Runner returns from `run(step, variables, context,
/// cancelToken)`. `attempts` is bounded by `retryPolicy.maxAttempts + 1`
/// (see §8 quantified invariants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<RecordedError>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl StepResult {
    pub fn pending(step_id: impl Into<StepId>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            data: HashMap::new(),
            errors: Vec::new(),
            start_time: None,
            end_time: None,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn terminal_statuses() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
    }

    #[test]
    fn pending_result_has_zero_attempts() {
        let result = StepResult::pending("s1");
        assert_eq!(result.attempts, 0);
        assert_eq!(result.status, StepStatus::Pending);
    }

    #[test]
    fn result_carries_recorded_errors() {
        let mut result = StepResult::pending("s1");
        result.errors.push(RecordedError::new(ErrorKind::StepTimeout, "deadline exceeded"));
        let json = serde_json::to_string(&result).unwrap();
        let parsed: StepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.errors.len(), 1);
    }
}
