//! The runtime materialization of an `Operation` under active orchestration.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution_context::ExecutionContext;
use crate::ids::{CheckpointId, OperationId, StepId};
use crate::operation::OperationStatus;

/// One instance per active Operation. `current_step_index` is advisory
/// (for `getStatus` progress display); the authoritative progress record
/// is [`OperationState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: uuid::Uuid,
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub current_step_index: Option<usize>,
    pub execution_context: ExecutionContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The mutable per-run record of progress and variables. Single-writer
/// (the Orchestrator's driver); readers only ever see a consistent
/// snapshot taken after a write completes (see §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationState {
    pub operation_id: OperationId,
    pub current_step: Option<StepId>,
    #[serde(default)]
    pub completed_steps: HashSet<StepId>,
    #[serde(default)]
    pub failed_steps: HashSet<StepId>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointId>,
    pub last_updated: DateTime<Utc>,
}

impl OperationState {
    pub fn new(operation_id: OperationId) -> Self {
        Self {
            operation_id,
            current_step: None,
            completed_steps: HashSet::new(),
            failed_steps: HashSet::new(),
            variables: HashMap::new(),
            checkpoints: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Invariant check from §3: `completedSteps ∩ failedSteps = ∅`.
    pub fn sets_are_disjoint(&self) -> bool {
        self.completed_steps.is_disjoint(&self.failed_steps)
    }
}
