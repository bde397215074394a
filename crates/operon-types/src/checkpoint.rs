//! Durable snapshots enabling deterministic resumption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CheckpointId, OperationId, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Full variables + completed/failed sets. Taken on pause, before
    /// compensation, and on-demand via the explicit API.
    StateSnapshot,
    /// After each non-`delay` step completion.
    ProgressMarker,
    /// Periodic (configurable cadence) or at declared plan checkpoints.
    RecoveryPoint,
}

/// A single checkpoint row. `data` is the opaque serialized
/// [`OperationState`](crate::instance::OperationState) at the moment the
/// checkpoint was taken; checkpoints are append-only and numbered
/// monotonically within an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub operation_id: OperationId,
    pub step_id: Option<StepId>,
    pub checkpoint_type: CheckpointType,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_serde_roundtrip() {
        let cp = Checkpoint {
            id: CheckpointId(3),
            operation_id: OperationId::new(),
            step_id: Some("s1".to_string()),
            checkpoint_type: CheckpointType::ProgressMarker,
            data: serde_json::json!({"variables": {}}),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&cp).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, CheckpointId(3));
        assert_eq!(parsed.checkpoint_type, CheckpointType::ProgressMarker);
    }
}
