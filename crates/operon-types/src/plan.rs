//! The execution plan: steps, their dependencies, and parallel grouping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution_context::RetryPolicy;
use crate::ids::StepId;

/// The kind of work a step performs. The Runner dispatches on this tag;
/// the Executor handles each variant's internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ToolCall,
    ArtifactGenerate,
    ApiRequest,
    DataTransform,
    ConditionCheck,
    Delay,
    ParallelGroup,
    ApprovalRequest,
}

/// Type-specific step configuration. The tag matches [`StepType`]; the
/// payload is handed to the external Step Executor verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    ToolCall { tool: String, #[serde(default)] params: Value },
    ArtifactGenerate { artifact_type: String, #[serde(default)] template: Option<String>, #[serde(default)] params: Value },
    ApiRequest {
        method: String,
        url: String,
        #[serde(default)]
        headers: Option<HashMap<String, String>>,
        #[serde(default)]
        body: Option<Value>,
    },
    DataTransform { expression: String },
    ConditionCheck { expression: String },
    Delay { duration_ms: u64 },
    ParallelGroup { group_id: String },
    ApprovalRequest { prompt: String, #[serde(default)] approvers: Vec<String> },
}

impl StepConfig {
    /// The [`StepType`] this configuration belongs to, for cross-checking
    /// against `ExecutionStep::step_type` during validation.
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::ToolCall { .. } => StepType::ToolCall,
            StepConfig::ArtifactGenerate { .. } => StepType::ArtifactGenerate,
            StepConfig::ApiRequest { .. } => StepType::ApiRequest,
            StepConfig::DataTransform { .. } => StepType::DataTransform,
            StepConfig::ConditionCheck { .. } => StepType::ConditionCheck,
            StepConfig::Delay { .. } => StepType::Delay,
            StepConfig::ParallelGroup { .. } => StepType::ParallelGroup,
            StepConfig::ApprovalRequest { .. } => StepType::ApprovalRequest,
        }
    }
}

/// A step's optional guard. If `expression` evaluates false against the
/// current variables, the step is skipped rather than run; `default` is
/// used when the expression cannot be evaluated (e.g. references a
/// variable that was never set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    pub expression: String,
    #[serde(default)]
    pub default: bool,
}

/// The reverse action run against a completed step during compensation.
/// Carries its own configuration and timeout; it is not itself retried
/// (compensation failures are logged and do not block progression to
/// `failed`, see §4.6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationStep {
    pub id: StepId,
    pub configuration: StepConfig,
    pub timeout_secs: Option<u64>,
}

fn default_required() -> bool {
    true
}

/// A single typed unit of work within an [`ExecutionPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: StepId,
    pub name: String,
    /// Stable tie-break for deterministic replay; see Plan Analyzer
    /// `(order, id)` ordering.
    pub order: u32,
    pub step_type: StepType,
    pub configuration: StepConfig,
    /// variableName -> paramName, resolved before invoking the Executor.
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    /// resultKey -> variableName, applied after a successful invocation.
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
    #[serde(default)]
    pub condition: Option<StepCondition>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub compensation: Option<CompensationStep>,
    /// Whether a fatal failure of this step (with no compensation) fails
    /// the whole operation. Defaults to `true`; mark `false` for
    /// best-effort steps whose failure should not halt the plan.
    #[serde(default = "default_required")]
    pub required: bool,
}

/// `{stepId, dependsOn, dependencyType}` — the structured dependency shape
/// this engine requires (see DESIGN.md for the Open Question resolution
/// on the legacy bare-string form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Sequential,
    Data,
    Resource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDependency {
    pub step_id: StepId,
    pub depends_on: Vec<StepId>,
    pub dependency_type: DependencyType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelExecutionPolicy {
    AllSuccess,
    AnySuccess,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    FailFast,
    Continue,
    RetryFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub id: String,
    /// At least 2 members; the Validator rejects smaller groups.
    pub step_ids: Vec<StepId>,
    pub execution_policy: ParallelExecutionPolicy,
    pub max_concurrency: u32,
    pub failure_policy: FailurePolicy,
}

/// The full execution plan submitted with an [`Operation`](crate::operation::Operation):
/// a DAG of steps plus optional parallel groupings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionPlan {
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub dependencies: Vec<StepDependency>,
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroup>,
    /// Step ids after which the Orchestrator takes an additional
    /// `recovery_point` checkpoint (§4.6.3), beyond the `progress_marker`
    /// every step completion already gets. The Validator rejects any id
    /// here that does not name a step in `steps`.
    #[serde(default)]
    pub checkpoints: Vec<StepId>,
}

impl ExecutionPlan {
    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The [`ParallelGroup`] containing `step_id`, if any.
    pub fn group_for_step(&self, step_id: &str) -> Option<&ParallelGroup> {
        self.parallel_groups.iter().find(|g| g.step_ids.iter().any(|s| s == step_id))
    }

    /// Whether `step_id` is a declared plan checkpoint (§4.6.3).
    pub fn is_declared_checkpoint(&self, step_id: &str) -> bool {
        self.checkpoints.iter().any(|id| id == step_id)
    }
}
