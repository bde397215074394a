//! Lifecycle events published to the Event Bus.
//!
//! `OperationEvent` is the unified event shape broadcast during operation
//! execution. All variants are Clone + Send + Sync for use with a
//! broadcast channel; the Event Bus is at-least-once, so consumers should
//! dedupe on `(operation_id, event_type, sequence_number)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::OperationId;

/// The event types named in §6's Event Bus topic list, minus the inbound
/// commands (those are requests, not lifecycle events -- see
/// `operon-core::supervisor` for the command API).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationEventType {
    OperationStarted,
    OperationCompleted,
    OperationFailed,
    OperationPaused,
    OperationResumed,
    OperationCancelled,
    StepStarted,
    StepCompleted,
    StepFailed,
    CheckpointCreated,
    ApprovalRequested,
    ApprovalReceived,
}

impl OperationEventType {
    /// The dotted topic name from §6, e.g. `"operation.started"`.
    pub fn topic(&self) -> &'static str {
        match self {
            OperationEventType::OperationStarted => "operation.started",
            OperationEventType::OperationCompleted => "operation.completed",
            OperationEventType::OperationFailed => "operation.failed",
            OperationEventType::OperationPaused => "operation.paused",
            OperationEventType::OperationResumed => "operation.resumed",
            OperationEventType::OperationCancelled => "operation.cancelled",
            OperationEventType::StepStarted => "step.started",
            OperationEventType::StepCompleted => "step.completed",
            OperationEventType::StepFailed => "step.failed",
            OperationEventType::CheckpointCreated => "checkpoint.created",
            OperationEventType::ApprovalRequested => "operation.approval_requested",
            OperationEventType::ApprovalReceived => "operation.approval_received",
        }
    }
}

/// `{operationId, eventType, data, timestamp, source}` from §3, plus the
/// `sequenceNumber` the Event Bus stamps on publish so consumers can
/// dedupe redelivered events on `(operation_id, event_type, sequence_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
    pub operation_id: OperationId,
    pub event_type: OperationEventType,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    /// Assigned by the Event Bus at publish time; `0` until then.
    #[serde(default)]
    pub sequence_number: u64,
}

impl OperationEvent {
    pub fn new(operation_id: OperationId, event_type: OperationEventType, source: impl Into<String>) -> Self {
        Self { operation_id, event_type, data: Value::Null, timestamp: Utc::now(), source: source.into(), sequence_number: 0 }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_match_event_bus_spec() {
        assert_eq!(OperationEventType::OperationStarted.topic(), "operation.started");
        assert_eq!(OperationEventType::StepFailed.topic(), "step.failed");
        assert_eq!(OperationEventType::CheckpointCreated.topic(), "checkpoint.created");
    }

    #[test]
    fn event_serde_roundtrip() {
        let event = OperationEvent::new(OperationId::new(), OperationEventType::StepCompleted, "orchestrator")
            .with_data(serde_json::json!({"step_id": "s1"}));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"step_completed\""));
        let parsed: OperationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, OperationEventType::StepCompleted);
        assert_eq!(parsed.data, serde_json::json!({"step_id": "s1"}));
    }
}
