//! One `thiserror` enum per component boundary, matching the taxonomy in
//! the engine's error handling design. `OrchestratorError` is the one
//! callers mostly see; the others are scoped to their component and get
//! folded into it where the orchestrator calls across a boundary.

use operon_types::ids::{CheckpointId, OperationId};
use operon_types::StepId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("plan has no steps")]
    EmptyPlan,
    #[error("duplicate step id: {0}")]
    DuplicateStepId(StepId),
    #[error("unknown step id referenced: {0}")]
    UnknownStepId(StepId),
    #[error("cyclic dependency detected involving step: {0}")]
    CycleDetected(StepId),
    #[error("non-positive resource limit for operation")]
    NonPositiveResourceLimit,
    #[error("operation timeout {given}s exceeds configured maximum {max}s")]
    TimeoutExceedsMaximum { given: u64, max: u64 },
    #[error("parameter type mismatch on step {step_id}: {detail}")]
    ParameterTypeMismatch { step_id: StepId, detail: String },
    #[error("invalid retry policy on {step_id}: max_attempts must be 0..=10 and max_delay_ms >= base_delay_ms")]
    InvalidRetryPolicy { step_id: StepId },
    #[error("checkpoint references missing step: {0}")]
    CheckpointMissingStep(StepId),
    #[error("parallel group {group} has fewer than 2 members")]
    ParallelGroupTooSmall { group: String },
    #[error("step {0} appears in more than one parallel group")]
    StepInMultipleGroups(StepId),
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("expression evaluation failed: {0}")]
    ExpressionError(String),
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("entity not found")]
    NotFound,
    #[error("version conflict on operation {0}: write rejected by compare-and-swap")]
    Conflict(OperationId),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ResourceGateError {
    #[error("resource unavailable: {0}")]
    Unavailable(String),
    #[error("no allocation found for operation {0}")]
    NoAllocation(OperationId),
}

#[derive(Debug, Clone, Error)]
pub enum StepExecutorError {
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
    /// The synthetic error the Step Runner manufactures itself when a
    /// step's own deadline elapses (§4.5); never returned by a
    /// `StepExecutor` implementation.
    #[error("{0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    #[error(transparent)]
    ResourceGate(#[from] ResourceGateError),
    #[error("step {step_id} failed: {error}")]
    StepFailed { step_id: StepId, error: String },
    #[error("step {step_id} timed out")]
    StepTimeout { step_id: StepId },
    #[error("step {step_id} was cancelled")]
    StepCancelled { step_id: StepId },
    #[error("operation timed out")]
    OperationTimeout,
    #[error("no ready step and plan incomplete: deadlock")]
    Deadlock,
    #[error("operation {0} is in a terminal state and cannot be transitioned")]
    TerminalState(OperationId),
    #[error("operation {0} not found")]
    OperationNotFound(OperationId),
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(CheckpointId),
    #[error("approval required for step {step_id}: {prompt}")]
    ApprovalRequired { step_id: StepId, prompt: String },
    #[error("compensation failed: {0}")]
    CompensationError(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    #[error("system shutdown in progress")]
    SystemShutdown,
}

impl OrchestratorError {
    /// Map to the taxonomy's `ErrorKind` (see `operon-types::error`), used
    /// when recording this error onto the operation's error list.
    pub fn kind(&self) -> operon_types::error::ErrorKind {
        use operon_types::error::ErrorKind;
        match self {
            OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::ResourceGate(_) => ErrorKind::ResourceUnavailable,
            OrchestratorError::StepTimeout { .. } => ErrorKind::StepTimeout,
            OrchestratorError::StepCancelled { .. } => ErrorKind::StepCancelled,
            OrchestratorError::StepFailed { .. } => ErrorKind::StepFatal,
            OrchestratorError::Deadlock => ErrorKind::Deadlock,
            OrchestratorError::StateStore(StateStoreError::Conflict(_)) => ErrorKind::StateConflict,
            OrchestratorError::CompensationError(_) => ErrorKind::CompensationError,
            OrchestratorError::SystemShutdown => ErrorKind::SystemShutdown,
            OrchestratorError::OperationTimeout => ErrorKind::StepTimeout,
            OrchestratorError::Cancelled(_) => ErrorKind::StepCancelled,
            _ => ErrorKind::StepFatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    #[error(transparent)]
    ResourceGate(#[from] ResourceGateError),
    #[error("operation {0} is already active")]
    AlreadyActive(OperationId),
    #[error("operation {0} is not active")]
    NotActive(OperationId),
    #[error("engine is at its configured concurrent-operation limit ({0})")]
    AtCapacity(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_error_kind_mapping() {
        let err = OrchestratorError::StepTimeout { step_id: "s1".to_string() };
        assert_eq!(err.kind(), operon_types::error::ErrorKind::StepTimeout);

        let err = OrchestratorError::Deadlock;
        assert_eq!(err.kind(), operon_types::error::ErrorKind::Deadlock);
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::CycleDetected("s1".to_string());
        assert!(err.to_string().contains("s1"));
    }
}
