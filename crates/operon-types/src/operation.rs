//! `Operation` — the submitted unit of work, and its security/metadata envelope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution_context::{ExecutionContext, Priority};
use crate::ids::OperationId;
use crate::plan::ExecutionPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ToolExecution,
    ArtifactGeneration,
    HybridWorkflow,
    ApprovalWorkflow,
    CompositeOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    WaitingApproval,
    Compensating,
}

impl OperationStatus {
    /// Terminal states are permanent; no further transitions are valid.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Identity and risk posture under which an operation executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityContext {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approval_workflow_id: Option<String>,
}

/// Conversation/session framing plus the security and execution envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    pub conversation_id: Option<String>,
    pub session_id: Option<String>,
    pub user_request: Option<String>,
    pub environment: Environment,
    #[serde(default)]
    pub constraints: HashMap<String, Value>,
    pub security: SecurityContext,
    pub execution: ExecutionContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub version: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub business_impact: Option<String>,
}

impl Default for OperationMetadata {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            source: None,
            tags: Vec::new(),
            priority: Priority::default(),
            estimated_cost: None,
            business_impact: None,
        }
    }
}

/// The submitted unit of work (see §3). Agent id / user id are free-form
/// identifiers supplied by the caller, not validated against any
/// authentication system here -- that belongs to the out-of-scope
/// audit/API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub context: OperationContext,
    pub plan: ExecutionPlan,
    #[serde(default)]
    pub metadata: OperationMetadata,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration_secs: Option<u64>,
    pub actual_duration_secs: Option<u64>,
}

impl Operation {
    /// §3 invariant: `completedAt` is set iff status is terminal, and
    /// `actualDuration = completedAt - startedAt` when both are defined.
    pub fn recompute_actual_duration(&mut self) {
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            let secs = (completed - started).num_seconds().max(0) as u64;
            self.actual_duration_secs = Some(secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_exactly_three() {
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(OperationStatus::Cancelled.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(!OperationStatus::Paused.is_terminal());
        assert!(!OperationStatus::WaitingApproval.is_terminal());
        assert!(!OperationStatus::Compensating.is_terminal());
    }

    #[test]
    fn recompute_actual_duration_only_when_both_timestamps_set() {
        let mut op = sample_operation();
        op.recompute_actual_duration();
        assert!(op.actual_duration_secs.is_none());

        op.started_at = Some(Utc::now());
        op.completed_at = Some(op.started_at.unwrap() + chrono::Duration::seconds(5));
        op.recompute_actual_duration();
        assert_eq!(op.actual_duration_secs, Some(5));
    }

    fn sample_operation() -> Operation {
        Operation {
            id: OperationId::new(),
            agent_id: None,
            user_id: None,
            name: "test-op".to_string(),
            description: None,
            operation_type: OperationType::ToolExecution,
            status: OperationStatus::Queued,
            context: OperationContext {
                conversation_id: None,
                session_id: None,
                user_request: None,
                environment: Environment::Development,
                constraints: HashMap::new(),
                security: SecurityContext {
                    user_id: None,
                    agent_id: None,
                    permissions: vec![],
                    risk_level: RiskLevel::Low,
                    requires_approval: false,
                    approval_workflow_id: None,
                },
                execution: ExecutionContext {
                    resource_limits: crate::execution_context::ResourceLimits {
                        max_memory_mb: 128,
                        max_cpu_millis: 1000,
                        max_duration_secs: 60,
                        max_concurrency: 1,
                    },
                    timeout_secs: 60,
                    retry_policy: crate::execution_context::RetryPolicy::none(),
                    priority: Priority::Normal,
                    execution_mode: crate::execution_context::ExecutionMode::Asynchronous,
                },
            },
            plan: ExecutionPlan::default(),
            metadata: OperationMetadata::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_secs: None,
            actual_duration_secs: None,
        }
    }

    #[test]
    fn operation_serde_roundtrip() {
        let op = sample_operation();
        let json = serde_json::to_string(&op).unwrap();
        let parsed: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "test-op");
        assert_eq!(parsed.status, OperationStatus::Queued);
    }
}
