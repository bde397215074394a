//! Shared domain types for the Operon orchestration engine.
//!
//! This crate contains the data model shared by every component of the
//! engine: `Operation`, `ExecutionPlan`, `WorkflowInstance`, `OperationState`,
//! `StepResult`, `Checkpoint`, and `OperationEvent`. It has no dependency on
//! any particular state store, executor, or transport -- those are defined
//! as traits in `operon-core`.

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod execution_context;
pub mod ids;
pub mod instance;
pub mod operation;
pub mod plan;
pub mod result;

pub use checkpoint::{Checkpoint, CheckpointType};
pub use error::{ErrorKind, RecordedError};
pub use event::{OperationEvent, OperationEventType};
pub use execution_context::{BackoffStrategy, ExecutionContext, ExecutionMode, Priority, ResourceLimits, RetryPolicy};
pub use ids::{CheckpointId, OperationId, StepId};
pub use instance::{OperationState, WorkflowInstance};
pub use operation::{Environment, Operation, OperationContext, OperationMetadata, OperationStatus, OperationType, RiskLevel, SecurityContext};
pub use plan::{
    CompensationStep, DependencyType, ExecutionPlan, ExecutionStep, FailurePolicy, ParallelExecutionPolicy,
    ParallelGroup, StepCondition, StepConfig, StepDependency, StepType,
};
pub use result::{StepResult, StepStatus};
