//! State Store Adapter: typed read/write of operation, instance, step
//! result, and checkpoint records.
//!
//! The port is a `StateStore` trait using native `async fn` (no
//! `async_trait` macro); `InMemoryStateStore` is the process-local adapter
//! this crate ships, built on `dashmap` for lock-free concurrent access
//! plus a per-operation version counter for compare-and-swap writes to
//! `OperationState`. A durable backend is an integration concern.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use operon_types::ids::{CheckpointId, OperationId};
use operon_types::operation::OperationStatus;
use operon_types::{Checkpoint, Operation, OperationState, StepResult, WorkflowInstance};
use uuid::Uuid;

use crate::error::StateStoreError;

/// `OperationState` plus the version it was read at, for compare-and-swap.
#[derive(Debug, Clone)]
pub struct VersionedState {
    pub state: OperationState,
    pub version: u64,
}

/// The port every orchestration component depends on. Never returns
/// partial state: an operation either has a readable `WorkflowInstance` +
/// `OperationState` pair or neither.
pub trait StateStore: Send + Sync {
    async fn create_operation(&self, operation: Operation) -> Result<(), StateStoreError>;

    async fn update_operation_status(
        &self,
        operation_id: OperationId,
        status: OperationStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StateStoreError>;

    async fn get_operation(&self, operation_id: OperationId) -> Result<Operation, StateStoreError>;

    async fn create_workflow_instance(&self, instance: WorkflowInstance) -> Result<(), StateStoreError>;

    async fn get_workflow_instance(&self, operation_id: OperationId) -> Result<WorkflowInstance, StateStoreError>;

    async fn save_step_result(&self, instance_id: Uuid, result: StepResult) -> Result<(), StateStoreError>;

    async fn get_step_results(&self, instance_id: Uuid) -> Result<Vec<StepResult>, StateStoreError>;

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StateStoreError>;

    async fn get_checkpoint(&self, operation_id: OperationId, checkpoint_id: CheckpointId) -> Result<Checkpoint, StateStoreError>;

    async fn latest_checkpoint(&self, operation_id: OperationId) -> Result<Option<Checkpoint>, StateStoreError>;

    async fn get_state(&self, operation_id: OperationId) -> Result<VersionedState, StateStoreError>;

    /// Compare-and-swap: succeeds only if `expected_version` matches the
    /// stored version, returning the new version. Otherwise rejects with
    /// `StateStoreError::Conflict`.
    async fn update_state(
        &self,
        operation_id: OperationId,
        expected_version: u64,
        new_state: OperationState,
    ) -> Result<u64, StateStoreError>;

    /// Non-terminal workflow instances last updated before `cutoff`.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<OperationId>, StateStoreError>;

    async fn list_active_leased_by(&self, engine_id: &str) -> Result<Vec<OperationId>, StateStoreError>;

    /// Claim ownership of `operation_id` for `engine_id`, used by the
    /// Supervisor's startup recovery to avoid two engines driving the
    /// same operation. Idempotent for the same `engine_id`; `false` if a
    /// different engine already holds the lease.
    async fn acquire_lease(&self, operation_id: OperationId, engine_id: &str) -> Result<bool, StateStoreError>;

    async fn release_lease(&self, operation_id: OperationId) -> Result<(), StateStoreError>;
}

/// Process-local, in-memory `StateStore`. Sufficient for embedding the
/// engine in a single process and for the test suite; a durable backend
/// lives in an integration crate behind the same trait.
#[derive(Default)]
pub struct InMemoryStateStore {
    operations: DashMap<OperationId, Operation>,
    instances: DashMap<OperationId, WorkflowInstance>,
    step_results: DashMap<Uuid, Vec<StepResult>>,
    checkpoints: DashMap<OperationId, Vec<Checkpoint>>,
    states: DashMap<OperationId, VersionedState>,
    leases: DashMap<OperationId, String>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl StateStore for InMemoryStateStore {
    async fn create_operation(&self, operation: Operation) -> Result<(), StateStoreError> {
        let operation_id = operation.id;
        self.states.insert(operation_id, VersionedState { state: OperationState::new(operation_id), version: 0 });
        self.operations.insert(operation_id, operation);
        Ok(())
    }

    async fn update_operation_status(
        &self,
        operation_id: OperationId,
        status: OperationStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StateStoreError> {
        let mut entry = self.operations.get_mut(&operation_id).ok_or(StateStoreError::NotFound)?;
        entry.status = status;
        if started_at.is_some() {
            entry.started_at = started_at;
        }
        if completed_at.is_some() {
            entry.completed_at = completed_at;
            entry.recompute_actual_duration();
        }
        Ok(())
    }

    async fn get_operation(&self, operation_id: OperationId) -> Result<Operation, StateStoreError> {
        self.operations.get(&operation_id).map(|e| e.clone()).ok_or(StateStoreError::NotFound)
    }

    async fn create_workflow_instance(&self, instance: WorkflowInstance) -> Result<(), StateStoreError> {
        self.instances.insert(instance.operation_id, instance);
        Ok(())
    }

    async fn get_workflow_instance(&self, operation_id: OperationId) -> Result<WorkflowInstance, StateStoreError> {
        self.instances.get(&operation_id).map(|e| e.clone()).ok_or(StateStoreError::NotFound)
    }

    async fn save_step_result(&self, instance_id: Uuid, result: StepResult) -> Result<(), StateStoreError> {
        self.step_results.entry(instance_id).or_default().push(result);
        Ok(())
    }

    async fn get_step_results(&self, instance_id: Uuid) -> Result<Vec<StepResult>, StateStoreError> {
        Ok(self.step_results.get(&instance_id).map(|e| e.clone()).unwrap_or_default())
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StateStoreError> {
        self.checkpoints.entry(checkpoint.operation_id).or_default().push(checkpoint);
        Ok(())
    }

    async fn get_checkpoint(&self, operation_id: OperationId, checkpoint_id: CheckpointId) -> Result<Checkpoint, StateStoreError> {
        self.checkpoints
            .get(&operation_id)
            .and_then(|list| list.iter().find(|c| c.id == checkpoint_id).cloned())
            .ok_or(StateStoreError::NotFound)
    }

    async fn latest_checkpoint(&self, operation_id: OperationId) -> Result<Option<Checkpoint>, StateStoreError> {
        Ok(self.checkpoints.get(&operation_id).and_then(|list| list.last().cloned()))
    }

    async fn get_state(&self, operation_id: OperationId) -> Result<VersionedState, StateStoreError> {
        self.states.get(&operation_id).map(|e| e.clone()).ok_or(StateStoreError::NotFound)
    }

    async fn update_state(
        &self,
        operation_id: OperationId,
        expected_version: u64,
        new_state: OperationState,
    ) -> Result<u64, StateStoreError> {
        let mut entry = self.states.get_mut(&operation_id).ok_or(StateStoreError::NotFound)?;
        if entry.version != expected_version {
            return Err(StateStoreError::Conflict(operation_id));
        }
        let next_version = entry.version + 1;
        *entry = VersionedState { state: new_state, version: next_version };
        Ok(next_version)
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<OperationId>, StateStoreError> {
        Ok(self
            .instances
            .iter()
            .filter(|entry| !entry.status.is_terminal() && entry.updated_at < cutoff)
            .map(|entry| entry.operation_id)
            .collect())
    }

    async fn list_active_leased_by(&self, engine_id: &str) -> Result<Vec<OperationId>, StateStoreError> {
        Ok(self
            .leases
            .iter()
            .filter(|entry| entry.value() == engine_id)
            .filter_map(|entry| {
                let operation_id = *entry.key();
                let is_active = self.instances.get(&operation_id).map(|i| !i.status.is_terminal()).unwrap_or(false);
                is_active.then_some(operation_id)
            })
            .collect())
    }

    async fn acquire_lease(&self, operation_id: OperationId, engine_id: &str) -> Result<bool, StateStoreError> {
        Ok(match self.leases.get(&operation_id) {
            Some(existing) if existing.as_str() != engine_id => false,
            _ => {
                self.leases.insert(operation_id, engine_id.to_string());
                true
            }
        })
    }

    async fn release_lease(&self, operation_id: OperationId) -> Result<(), StateStoreError> {
        self.leases.remove(&operation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use operon_types::execution_context::{ExecutionMode, Priority, ResourceLimits, RetryPolicy};
    use operon_types::operation::{Environment, OperationContext, OperationMetadata, OperationStatus, OperationType, RiskLevel, SecurityContext};
    use operon_types::plan::ExecutionPlan;
    use operon_types::{CheckpointType, ExecutionContext};

    use super::*;

    fn sample_operation() -> Operation {
        let id = OperationId::new();
        Operation {
            id,
            agent_id: None,
            user_id: None,
            name: "test".to_string(),
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
                    resource_limits: ResourceLimits { max_memory_mb: 64, max_cpu_millis: 500, max_duration_secs: 30, max_concurrency: 1 },
                    timeout_secs: 30,
                    retry_policy: RetryPolicy::none(),
                    priority: Priority::Normal,
                    execution_mode: ExecutionMode::Asynchronous,
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

    #[tokio::test]
    async fn create_and_get_operation_roundtrips() {
        let store = InMemoryStateStore::new();
        let op = sample_operation();
        let id = op.id;
        store.create_operation(op).await.unwrap();
        let fetched = store.get_operation(id).await.unwrap();
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn get_operation_missing_returns_not_found() {
        let store = InMemoryStateStore::new();
        let err = store.get_operation(OperationId::new()).await.unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound));
    }

    #[tokio::test]
    async fn update_state_rejects_stale_version() {
        let store = InMemoryStateStore::new();
        let op = sample_operation();
        let id = op.id;
        store.create_operation(op).await.unwrap();

        let versioned = store.get_state(id).await.unwrap();
        assert_eq!(versioned.version, 0);

        let mut next = versioned.state.clone();
        next.variables.insert("x".to_string(), serde_json::json!(1));
        let new_version = store.update_state(id, 0, next).await.unwrap();
        assert_eq!(new_version, 1);

        // Stale CAS using the old version now fails.
        let err = store.update_state(id, 0, OperationState::new(id)).await.unwrap_err();
        assert!(matches!(err, StateStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn checkpoints_are_append_only_and_latest_is_last() {
        let store = InMemoryStateStore::new();
        let op = sample_operation();
        let id = op.id;
        store.create_operation(op).await.unwrap();

        for n in 0..3u64 {
            store
                .save_checkpoint(Checkpoint {
                    id: CheckpointId(n),
                    operation_id: id,
                    step_id: None,
                    checkpoint_type: CheckpointType::ProgressMarker,
                    data: serde_json::json!({}),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let latest = store.latest_checkpoint(id).await.unwrap().unwrap();
        assert_eq!(latest.id, CheckpointId(2));
    }

    #[tokio::test]
    async fn lease_acquisition_is_exclusive_per_operation() {
        let store = InMemoryStateStore::new();
        let id = OperationId::new();
        assert!(store.acquire_lease(id, "engine-a").await.unwrap());
        assert!(!store.acquire_lease(id, "engine-b").await.unwrap());
        assert!(store.acquire_lease(id, "engine-a").await.unwrap());
    }
}
