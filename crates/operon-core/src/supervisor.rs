//! Supervisor: owns the lifecycle of every active operation in this
//! process end to end -- submission, status, pause/resume/cancel,
//! on-demand checkpoints, the operation-wide wall-clock timeout, a
//! periodic stale-operation sweep, graceful shutdown, and startup
//! recovery. Everything else in this crate (Validator, Resource Gate,
//! State Store, Orchestrator) is a component the Supervisor composes;
//! nothing outside this module calls them directly.
//!
//! The active-instance registry is a `DashMap<OperationId,
//! OperationHandle>`: each handle carries the command channel, the
//! `CancellationToken` the driver observes, and a `JoinHandle` to the
//! task driving it. Entries are inserted before the driver's first poll
//! and removed once it settles, mirroring the run registry in
//! `DagExecutor` (`crates/boternity-core/src/workflow/executor.rs`) --
//! see DESIGN.md.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use operon_types::ids::{CheckpointId, OperationId, StepId};
use operon_types::operation::{Operation, OperationStatus};
use operon_types::{CheckpointType, RecordedError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::compensation::CompensationExecutor;
use crate::config::EngineConfig;
use crate::error::SupervisorError;
use crate::event_bus::EventBus;
use crate::orchestrator::{DriverCommand, Orchestrator};
use crate::resource_gate::ResourceGate;
use crate::state_store::StateStore;
use crate::step_runner::StepExecutor;
use crate::validator;

/// §6 `SubmitRequest`: the caller hands over a fully-formed `Operation`;
/// `Supervisor::submit` is where validation and admission actually happen.
pub struct SubmitRequest {
    pub operation: Operation,
}

/// §6 `StatusResponse`.
#[derive(Debug, Clone)]
pub struct StatusResponse {
    pub operation: Operation,
    pub current_step: Option<StepId>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub percentage: f64,
    pub metrics: StatusMetrics,
    pub errors: Vec<RecordedError>,
}

/// Aggregated across every step result recorded so far for this operation.
#[derive(Debug, Clone, Default)]
pub struct StatusMetrics {
    pub attempts_total: u32,
    pub steps_completed: usize,
    pub steps_failed: usize,
}

pub struct PauseRequest {
    pub operation_id: OperationId,
    pub reason: Option<String>,
}

pub struct ResumeRequest {
    pub operation_id: OperationId,
    pub checkpoint_id: Option<CheckpointId>,
}

pub struct CancelRequest {
    pub operation_id: OperationId,
    pub reason: String,
    pub compensate: bool,
    pub force: bool,
}

impl CancelRequest {
    /// The common case: a graceful cancel that runs compensation and
    /// waits for the driver to notice through its command channel.
    pub fn new(operation_id: OperationId, reason: impl Into<String>) -> Self {
        Self { operation_id, reason: reason.into(), compensate: true, force: false }
    }
}

pub struct CreateCheckpointRequest {
    pub operation_id: OperationId,
    pub checkpoint_type: CheckpointType,
    pub step_id: Option<StepId>,
}

/// The external decision on an `approval_request` step a driver is
/// currently blocked on.
pub struct ApprovalDecisionRequest {
    pub operation_id: OperationId,
    pub step_id: StepId,
    pub approved: bool,
}

/// Everything the Supervisor needs to reach a running driver without
/// routing back through the state store.
struct OperationHandle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    cancel: CancellationToken,
    #[allow(dead_code)]
    join: JoinHandle<()>,
}

/// Owns the active-operation registry and composes the Validator,
/// Resource Gate, State Store, and Orchestrator into the external
/// interface from §6.
pub struct Supervisor<S, E, C> {
    orchestrator: Arc<Orchestrator<S, E, C>>,
    state_store: Arc<S>,
    resource_gate: Arc<ResourceGate>,
    event_bus: EventBus,
    config: EngineConfig,
    active: Arc<DashMap<OperationId, OperationHandle>>,
}

impl<S, E, C> Supervisor<S, E, C>
where
    S: StateStore + 'static,
    E: StepExecutor + 'static,
    C: CompensationExecutor + 'static,
{
    pub fn new(state_store: Arc<S>, step_executor: Arc<E>, compensation_executor: C, config: EngineConfig) -> Self {
        let event_bus = EventBus::default();
        let resource_gate = Arc::new(ResourceGate::new(config.resource_pool));
        let orchestrator = Arc::new(Orchestrator::new(state_store.clone(), step_executor, compensation_executor, event_bus.clone(), config.clone()));
        Self { orchestrator, state_store, resource_gate, event_bus, config, active: Arc::new(DashMap::new()) }
    }

    /// Subscribe to every lifecycle event this engine instance publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<operon_types::OperationEvent> {
        self.event_bus.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// `submit(Operation) -> instanceId` (§6). Validates, admits into the
    /// Resource Gate, claims the lease, and spawns the driver -- in that
    /// order, so a rejected or unavailable operation never touches the
    /// lease table or the active registry.
    pub async fn submit(&self, request: SubmitRequest) -> Result<uuid::Uuid, SupervisorError> {
        let operation = request.operation;
        if self.active.contains_key(&operation.id) {
            return Err(SupervisorError::AlreadyActive(operation.id));
        }

        // §6's global admission cap: checked before validation touches
        // anything durable, so a full engine rejects cheaply.
        if self.active.len() >= self.config.max_concurrent_operations as usize {
            return Err(SupervisorError::AtCapacity(self.config.max_concurrent_operations));
        }

        validator::validate(&operation, self.config.operation_timeout_max_secs)?;

        self.resource_gate
            .allocate(operation.id, operation.context.execution.resource_limits, operation.context.execution.priority)
            .await?;

        if !self.state_store.acquire_lease(operation.id, &self.config.engine_id).await? {
            self.resource_gate.release(operation.id);
            return Err(SupervisorError::AlreadyActive(operation.id));
        }

        let instance_id = uuid::Uuid::now_v7();
        Ok(self.spawn_driver(operation, instance_id, None))
    }

    /// `getStatus(opId)` (§6): `{operation, currentStep?, completedSteps,
    /// totalSteps, percentage, metrics, errors}`, read from whatever the
    /// state store currently has -- synced at every checkpoint boundary,
    /// so this can lag the driver's in-flight step by at most one batch.
    pub async fn get_status(&self, operation_id: OperationId) -> Result<StatusResponse, SupervisorError> {
        let operation = self.state_store.get_operation(operation_id).await?;
        let state = self.state_store.get_state(operation_id).await?.state;

        let step_results = match self.state_store.get_workflow_instance(operation_id).await {
            Ok(instance) => self.state_store.get_step_results(instance.id).await.unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        let total_steps = operation.plan.steps.len();
        let completed_steps = state.completed_steps.len();
        let percentage = if total_steps == 0 { 100.0 } else { (completed_steps as f64 / total_steps as f64) * 100.0 };

        let metrics = StatusMetrics {
            attempts_total: step_results.iter().map(|r| r.attempts).sum(),
            steps_completed: completed_steps,
            steps_failed: state.failed_steps.len(),
        };
        let errors = step_results.iter().flat_map(|r| r.errors.clone()).collect();

        Ok(StatusResponse {
            operation,
            current_step: state.current_step,
            completed_steps,
            total_steps,
            percentage,
            metrics,
            errors,
        })
    }

    /// `pause(opId, reason?)` (§6). `reason` has nowhere to live on the
    /// wire-level `DriverCommand::Pause` (it carries no payload); it is
    /// only ever used for this call's own log line.
    pub fn pause(&self, request: PauseRequest) -> Result<(), SupervisorError> {
        let handle = self.active.get(&request.operation_id).ok_or(SupervisorError::NotActive(request.operation_id))?;
        handle.commands.send(DriverCommand::Pause).map_err(|_| SupervisorError::NotActive(request.operation_id))?;
        tracing::info!(operation_id = %request.operation_id, reason = request.reason.as_deref().unwrap_or("none"), "pause requested");
        Ok(())
    }

    /// `resume(opId, checkpointId?)` (§6).
    pub fn resume(&self, request: ResumeRequest) -> Result<(), SupervisorError> {
        let handle = self.active.get(&request.operation_id).ok_or(SupervisorError::NotActive(request.operation_id))?;
        handle
            .commands
            .send(DriverCommand::Resume(request.checkpoint_id))
            .map_err(|_| SupervisorError::NotActive(request.operation_id))?;
        Ok(())
    }

    /// `cancel(opId, reason, compensate=true, force=false)` (§6). `force`
    /// fires the shared `CancellationToken` immediately, independent of
    /// whether the driver ever drains the command -- the only way to
    /// interrupt a step that is blocked inside its own executor call and
    /// not polling the channel.
    pub fn cancel(&self, request: CancelRequest) -> Result<(), SupervisorError> {
        let handle = self.active.get(&request.operation_id).ok_or(SupervisorError::NotActive(request.operation_id))?;
        if request.force {
            handle.cancel.cancel();
        }
        handle
            .commands
            .send(DriverCommand::Cancel { reason: request.reason, compensate: request.compensate, force: request.force })
            .map_err(|_| SupervisorError::NotActive(request.operation_id))?;
        Ok(())
    }

    /// `createCheckpoint(opId, type, stepId?) -> checkpointId` (§6). The
    /// sender is cloned out of the registry entry before the first
    /// `.await` so the `DashMap` shard guard never lives across a
    /// suspension point.
    pub async fn create_checkpoint(&self, request: CreateCheckpointRequest) -> Result<CheckpointId, SupervisorError> {
        let sender = {
            let handle = self.active.get(&request.operation_id).ok_or(SupervisorError::NotActive(request.operation_id))?;
            handle.commands.clone()
        };
        let (ack, ack_rx) = oneshot::channel();
        sender
            .send(DriverCommand::CreateCheckpoint { checkpoint_type: request.checkpoint_type, step_id: request.step_id, ack })
            .map_err(|_| SupervisorError::NotActive(request.operation_id))?;
        ack_rx.await.map_err(|_| SupervisorError::NotActive(request.operation_id))
    }

    /// Deliver an approval/rejection decision to the driver currently
    /// suspended on the named `approval_request` step.
    pub fn submit_approval_decision(&self, request: ApprovalDecisionRequest) -> Result<(), SupervisorError> {
        let handle = self.active.get(&request.operation_id).ok_or(SupervisorError::NotActive(request.operation_id))?;
        handle
            .commands
            .send(DriverCommand::ApprovalDecision { step_id: request.step_id, approved: request.approved })
            .map_err(|_| SupervisorError::NotActive(request.operation_id))?;
        Ok(())
    }

    /// Spawn the driver task for `operation`. `resume_from`, when set,
    /// pre-queues a `Resume(Some(checkpoint_id))` ahead of the first
    /// `drain_commands` call in `drive`, so the restored `OperationState`
    /// is in place before any ready-set is computed. The outer task races
    /// the inner driver against the operation's own wall-clock timeout;
    /// on timeout it sends a compensating cancel and keeps waiting for the
    /// driver to settle rather than aborting the task outright, so
    /// in-flight compensation still runs to completion.
    fn spawn_driver(&self, operation: Operation, instance_id: uuid::Uuid, resume_from: Option<CheckpointId>) -> uuid::Uuid {
        let operation_id = operation.id;
        let timeout = Duration::from_secs(operation.context.execution.timeout_secs);

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(checkpoint_id) = resume_from {
            let _ = tx.send(DriverCommand::Resume(Some(checkpoint_id)));
        }

        let cancel = CancellationToken::new();
        let driver_cancel = cancel.clone();
        let driver_tx = tx.clone();
        let orchestrator = self.orchestrator.clone();
        let resource_gate = self.resource_gate.clone();
        let active = self.active.clone();

        let join = tokio::spawn(async move {
            let mut driver = tokio::spawn(async move { orchestrator.drive(operation, instance_id, rx, driver_cancel).await });

            tokio::select! {
                result = &mut driver => log_driver_outcome(operation_id, result, "completed"),
                _ = tokio::time::sleep(timeout) => {
                    tracing::warn!(operation_id = %operation_id, timeout_secs = timeout.as_secs(), "operation exceeded its wall-clock timeout; cancelling with compensation");
                    let _ = driver_tx.send(DriverCommand::Cancel { reason: "operation timeout exceeded".to_string(), compensate: true, force: false });
                    let result = (&mut driver).await;
                    log_driver_outcome(operation_id, result, "completed after timeout");
                }
            }

            resource_gate.release(operation_id);
            active.remove(&operation_id);
        });

        self.active.insert(operation_id, OperationHandle { commands: tx, cancel, join });
        instance_id
    }

    /// Periodic stale-operation sweep: cancel (with `force`, since a
    /// stale operation's driver may be stuck inside a step that never
    /// checks its command channel) anything this engine is actively
    /// driving that the state store has not seen an update from since
    /// `stale_operation_threshold`. Returns a `JoinHandle` the caller owns
    /// and may abort on shutdown.
    pub fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.cleanup_interval());
            loop {
                ticker.tick().await;
                supervisor.sweep_stale().await;
            }
        })
    }

    async fn sweep_stale(&self) {
        let cutoff = Utc::now() - self.config.stale_operation_threshold();
        let stale = match self.state_store.find_stale(cutoff).await {
            Ok(ids) => ids,
            Err(error) => {
                tracing::warn!(%error, "stale sweep could not query the state store");
                return;
            }
        };
        for operation_id in stale {
            if self.active.contains_key(&operation_id) {
                tracing::warn!(operation_id = %operation_id, "cancelling stale operation with no progress since the configured threshold");
                let _ = self.cancel(CancelRequest { operation_id, reason: "stale-cleanup".to_string(), compensate: true, force: true });
            }
        }
    }

    /// Graceful shutdown (§6): pause every active operation with reason
    /// `system-shutdown` (each pause flushes a `state_snapshot`
    /// checkpoint before blocking), wait up to `grace_period` for drivers
    /// to settle, then abandon whatever remains -- a paused driver parks
    /// forever on its command channel, so "abandon" here just means
    /// returning control to the caller; the parked tasks and their
    /// checkpoints are picked back up by `recover` on the next startup.
    pub async fn shutdown(&self, grace_period: Duration) {
        let operation_ids: Vec<OperationId> = self.active.iter().map(|entry| *entry.key()).collect();
        for operation_id in &operation_ids {
            if let Err(error) = self.pause(PauseRequest { operation_id: *operation_id, reason: Some("system-shutdown".to_string()) }) {
                tracing::warn!(operation_id = %operation_id, %error, "could not pause operation during shutdown");
            }
        }

        let deadline = tokio::time::Instant::now() + grace_period;
        while tokio::time::Instant::now() < deadline && !self.active.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if !self.active.is_empty() {
            tracing::warn!(remaining = self.active.len(), "shutdown grace period elapsed with operations still active; abandoning them for recovery on restart");
        }
    }

    /// Startup recovery (§6): scan the state store for non-terminal
    /// operations this engine can claim and resume each from its latest
    /// checkpoint. There is no dedicated "list non-terminal operations"
    /// query on `StateStore`; `find_stale` with a cutoff far in the
    /// future degrades exactly into that (every non-terminal instance's
    /// `updated_at` is necessarily before a cutoff a century out), so it
    /// is reused here rather than adding a near-duplicate method -- see
    /// DESIGN.md. Returns the number of operations actually resumed.
    pub async fn recover(&self) -> Result<usize, SupervisorError> {
        let distant_future = Utc::now() + chrono::Duration::days(365 * 100);
        let candidates = self.state_store.find_stale(distant_future).await?;

        let mut recovered = 0;
        for operation_id in candidates {
            if self.active.contains_key(&operation_id) {
                continue;
            }
            if !self.state_store.acquire_lease(operation_id, &self.config.engine_id).await? {
                continue; // leased to a different, presumably still-live engine
            }

            match self.try_recover_one(operation_id).await {
                Ok(true) => recovered += 1,
                Ok(false) => {
                    let _ = self.state_store.release_lease(operation_id).await;
                }
                Err(error) => {
                    tracing::warn!(operation_id = %operation_id, %error, "failed to recover operation, leaving it leased for a later attempt");
                }
            }
        }
        Ok(recovered)
    }

    /// Returns `Ok(true)` if `operation_id` was actually resumed,
    /// `Ok(false)` if it turned out not to need resuming (already
    /// terminal, or its rows are missing) -- in which case the caller
    /// releases the lease it just acquired rather than holding it.
    async fn try_recover_one(&self, operation_id: OperationId) -> Result<bool, SupervisorError> {
        let operation = self.state_store.get_operation(operation_id).await?;
        if operation.status.is_terminal() {
            return Ok(false);
        }
        let instance = self.state_store.get_workflow_instance(operation_id).await?;
        let checkpoint = self.state_store.latest_checkpoint(operation_id).await?;

        self.resource_gate
            .allocate(operation.id, operation.context.execution.resource_limits, operation.context.execution.priority)
            .await?;

        tracing::info!(operation_id = %operation_id, checkpoint = ?checkpoint.as_ref().map(|c| c.id), "recovering operation");
        self.spawn_driver(operation, instance.id, checkpoint.map(|c| c.id));
        Ok(true)
    }
}

fn log_driver_outcome(operation_id: OperationId, result: Result<Result<OperationStatus, crate::error::OrchestratorError>, tokio::task::JoinError>, when: &str) {
    match result {
        Ok(Ok(status)) => tracing::info!(operation_id = %operation_id, ?status, "operation {when}"),
        Ok(Err(error)) => tracing::warn!(operation_id = %operation_id, %error, "operation driver returned an error ({when})"),
        Err(join_error) => tracing::error!(operation_id = %operation_id, %join_error, "driver task panicked ({when})"),
    }
}
