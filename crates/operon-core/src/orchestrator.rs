//! Workflow Orchestrator: drives a single operation's state machine from
//! `queued` through to a terminal state.
//!
//! One `Orchestrator::drive` call is "the driver" for exactly one
//! operation (see §5's single-writer-per-operation model): it owns the
//! only mutable `OperationState` for that operation, serializes every
//! write through itself, and is the sole caller of the Step Runner and
//! Compensation Runner for that operation. The Supervisor is responsible
//! for spawning one such call per active operation and for imposing the
//! operation-wide wall-clock timeout from the outside.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use operon_types::execution_context::RetryPolicy;
use operon_types::ids::{CheckpointId, StepId};
use operon_types::event::{OperationEvent, OperationEventType};
use operon_types::operation::{Operation, OperationStatus};
use operon_types::plan::{ExecutionPlan, ExecutionStep, FailurePolicy, ParallelExecutionPolicy, ParallelGroup};
use operon_types::result::{StepResult, StepStatus};
use operon_types::{Checkpoint, CheckpointType, OperationState, WorkflowInstance};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::compensation::{run_compensation, CompensationExecutor};
use crate::condition::JexlConditionEvaluator;
use crate::config::EngineConfig;
use crate::error::OrchestratorError;
use crate::event_bus::EventBus;
use crate::plan::{ready_set, ReadyBatch};
use crate::state_store::StateStore;
use crate::step_runner::{StepExecutor, StepRunner};

/// Out-of-band control signals the Supervisor (or an API handler) sends
/// into a running driver. Delivered over an unbounded channel so sending
/// never blocks the caller on the driver's progress.
pub enum DriverCommand {
    Pause,
    /// `None` resumes from wherever the driver currently is (used when
    /// pause/resume happens within the same process lifetime); `Some`
    /// restores `OperationState` from a specific checkpoint first (used
    /// after a crash/restart, or when the Supervisor replays a recovered
    /// operation's last checkpoint before re-entering the main loop).
    Resume(Option<CheckpointId>),
    Cancel { reason: String, compensate: bool, force: bool },
    /// Explicit, on-demand checkpoint requested through the Supervisor's
    /// `createCheckpoint` API (§6). Answered on `ack` with the id of the
    /// checkpoint just written.
    CreateCheckpoint { checkpoint_type: CheckpointType, step_id: Option<StepId>, ack: oneshot::Sender<CheckpointId> },
    /// The external decision on an in-flight `approval_request` step.
    /// Delivered the same way as `Cancel`/`CreateCheckpoint`: over the
    /// operation's command channel, answered by the driver the next time
    /// it reads from that channel (which, while waiting on approval, is
    /// immediately).
    ApprovalDecision { step_id: StepId, approved: bool },
}

impl std::fmt::Debug for DriverCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverCommand::Pause => write!(f, "Pause"),
            DriverCommand::Resume(id) => f.debug_tuple("Resume").field(id).finish(),
            DriverCommand::Cancel { reason, compensate, force } => {
                f.debug_struct("Cancel").field("reason", reason).field("compensate", compensate).field("force", force).finish()
            }
            DriverCommand::CreateCheckpoint { checkpoint_type, step_id, .. } => {
                f.debug_struct("CreateCheckpoint").field("checkpoint_type", checkpoint_type).field("step_id", step_id).finish()
            }
            DriverCommand::ApprovalDecision { step_id, approved } => {
                f.debug_struct("ApprovalDecision").field("step_id", step_id).field("approved", approved).finish()
            }
        }
    }
}

pub struct Orchestrator<S, E, C> {
    state_store: Arc<S>,
    compensation_executor: C,
    condition_evaluator: JexlConditionEvaluator,
    event_bus: EventBus,
    config: EngineConfig,
    step_executor: Arc<E>,
}

impl<S, E, C> Orchestrator<S, E, C>
where
    S: StateStore,
    E: StepExecutor,
    C: CompensationExecutor,
{
    pub fn new(state_store: Arc<S>, step_executor: Arc<E>, compensation_executor: C, event_bus: EventBus, config: EngineConfig) -> Self {
        Self {
            state_store,
            compensation_executor,
            condition_evaluator: JexlConditionEvaluator::new(),
            event_bus,
            config,
            step_executor,
        }
    }

    /// Drive `operation` from `queued` to a terminal state, consuming
    /// `commands` for pause/resume/cancel. `instance_id` is minted by the
    /// caller (the Supervisor's `submit`) so it can be returned to the
    /// original caller before the driver has made any progress. `cancel`
    /// is likewise owned by the caller: the Supervisor keeps it in the
    /// operation's registry entry so a `force` cancel can be observed by
    /// this driver's in-flight step without routing back through the
    /// command channel. Returns the terminal status on success; `Err`
    /// only for conditions the operation itself could not resolve
    /// (deadlock, state store failure, system shutdown).
    pub async fn drive(
        &self,
        operation: Operation,
        instance_id: uuid::Uuid,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
        cancel: CancellationToken,
    ) -> Result<OperationStatus, OrchestratorError> {
        let operation_id = operation.id;
        let plan = operation.plan.clone();
        let default_retry = if operation.context.execution.retry_policy.max_attempts > 0 {
            operation.context.execution.retry_policy.clone()
        } else {
            self.config.default_retry_policy.clone()
        };

        // A recovery replay (the Supervisor resuming a leased operation
        // after a restart) calls `drive` for an operation id that already
        // has a persisted `Operation`/`WorkflowInstance` row; skip the
        // fresh-submission bookkeeping so it isn't stomped back to step 0.
        // The caller queues a `Resume(Some(checkpoint_id))` ahead of this
        // call, which restores `state` below before any ready-set is read.
        let resuming = self.state_store.get_operation(operation_id).await.is_ok();
        if !resuming {
            self.state_store.create_operation(operation.clone()).await?;
            self.state_store
                .create_workflow_instance(WorkflowInstance {
                    id: instance_id,
                    operation_id,
                    status: OperationStatus::Running,
                    current_step_index: Some(0),
                    execution_context: operation.context.execution.clone(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .await?;
            self.state_store.update_operation_status(operation_id, OperationStatus::Running, Some(Utc::now()), None).await?;
            self.publish(operation_id, OperationEventType::OperationStarted);
        }

        let mut state = OperationState::new(operation_id);
        let mut running: HashSet<StepId> = HashSet::new();
        let mut completion_order: Vec<StepId> = Vec::new();
        let mut steps_since_periodic_checkpoint: u32 = 0;
        let step_runner = StepRunner::new(SharedExecutor(self.step_executor.clone()));

        loop {
            if let Some(status) = self.drain_commands(operation_id, &plan, &completion_order, &mut state, &mut commands, &cancel).await? {
                return Ok(status);
            }

            let ready = ready_set(&plan, &state, &running, &self.condition_evaluator).map_err(|e| match e {
                crate::error::PlanError::Validation(v) => OrchestratorError::Validation(v),
                crate::error::PlanError::ExpressionError(msg) => OrchestratorError::StepFailed { step_id: "<condition>".to_string(), error: msg },
            })?;
            for skipped in ready.newly_skipped {
                state.completed_steps.insert(skipped);
            }

            if ready.batches.is_empty() {
                // §4.6: `running -> completed` requires the ready set to
                // be exhausted over every plan step AND no fatal failure;
                // a failed_steps entry that should_fail_operation() flags
                // must fail the operation even if every step has settled.
                if let Some(failed_id) = state.failed_steps.iter().find(|id| should_fail_operation(&plan, id, &state.failed_steps)).cloned() {
                    return self.fail_operation(operation_id, &plan, &completion_order, failed_id, false).await;
                }

                let total = plan.steps.len();
                let settled = state.completed_steps.len() + state.failed_steps.len();
                if settled >= total {
                    self.state_store.update_operation_status(operation_id, OperationStatus::Completed, None, Some(Utc::now())).await?;
                    self.publish(operation_id, OperationEventType::OperationCompleted);
                    return Ok(OperationStatus::Completed);
                }
                return Err(OrchestratorError::Deadlock);
            }

            let before = completion_order.len();
            let batch = ready.batches.into_iter().next().expect("checked non-empty above");
            match batch {
                ReadyBatch::Single(step) if step.step_type == operon_types::plan::StepType::ApprovalRequest => {
                    running.insert(step.id.clone());
                    state.current_step = Some(step.id.clone());
                    self.publish(operation_id, OperationEventType::StepStarted);
                    let outcome = self.run_approval(operation_id, &plan, &completion_order, step, &mut state, &mut commands, &cancel).await?;
                    running.remove(&step.id);
                    match outcome {
                        ApprovalOutcome::Decided(result) => {
                            self.record_result(&mut state, step, result, &mut completion_order, operation_id, instance_id, &plan).await?;
                        }
                        ApprovalOutcome::Cancelled(status) => return Ok(status),
                    }
                }
                ReadyBatch::Single(step) => {
                    running.insert(step.id.clone());
                    state.current_step = Some(step.id.clone());
                    self.publish(operation_id, OperationEventType::StepStarted);
                    let result = step_runner.run(step, &mut state.variables, &default_retry, &cancel).await;
                    running.remove(&step.id);
                    self.record_result(&mut state, step, result, &mut completion_order, operation_id, instance_id, &plan).await?;
                }
                ReadyBatch::Group { group, steps } => {
                    self.run_group(group, steps, &mut state, &default_retry, &cancel, &mut completion_order, operation_id, instance_id, &step_runner).await?;
                }
            }

            if let Some(n) = self.config.checkpoint_every_n_steps {
                steps_since_periodic_checkpoint += (completion_order.len() - before) as u32;
                if n > 0 && steps_since_periodic_checkpoint >= n {
                    steps_since_periodic_checkpoint = 0;
                    self.checkpoint(operation_id, CheckpointType::RecoveryPoint, state.current_step.clone(), &mut state).await?;
                }
            }

            if let Some(failed_id) = state.failed_steps.iter().find(|id| should_fail_operation(&plan, id, &state.failed_steps)).cloned() {
                return self.fail_operation(operation_id, &plan, &completion_order, failed_id, false).await;
            }
        }
    }

    /// Drain any pending commands without blocking. Returns `Some(status)`
    /// if the operation reached a terminal state while handling a
    /// command (cancel); `None` to continue the main loop.
    async fn drain_commands(
        &self,
        operation_id: operon_types::OperationId,
        plan: &ExecutionPlan,
        completion_order: &[StepId],
        state: &mut OperationState,
        commands: &mut mpsc::UnboundedReceiver<DriverCommand>,
        cancel: &CancellationToken,
    ) -> Result<Option<OperationStatus>, OrchestratorError> {
        loop {
            let command = match commands.try_recv() {
                Ok(c) => c,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(None),
            };

            match command {
                DriverCommand::Pause => {
                    self.checkpoint(operation_id, CheckpointType::StateSnapshot, None, state).await?;
                    self.state_store.update_operation_status(operation_id, OperationStatus::Paused, None, None).await?;
                    self.publish(operation_id, OperationEventType::OperationPaused);

                    // Block here until resume/cancel arrives; new ready
                    // batches are never dispatched while paused. A
                    // checkpoint request or a repeated pause while
                    // already paused keeps this loop waiting instead of
                    // falling through to the dispatch loop still marked
                    // `paused` in the store.
                    loop {
                        match commands.recv().await {
                            Some(DriverCommand::Resume(checkpoint_id)) => {
                                if let Some(id) = checkpoint_id {
                                    *state = self.restore_state(operation_id, id).await?;
                                }
                                self.state_store.update_operation_status(operation_id, OperationStatus::Running, None, None).await?;
                                self.publish(operation_id, OperationEventType::OperationResumed);
                                break;
                            }
                            Some(DriverCommand::Cancel { reason, compensate, force }) => {
                                return Ok(Some(self.cancel_operation(operation_id, plan, completion_order, reason, compensate, force, cancel).await?));
                            }
                            Some(DriverCommand::CreateCheckpoint { checkpoint_type, step_id, ack }) => {
                                let id = self.checkpoint(operation_id, checkpoint_type, step_id, state).await?;
                                let _ = ack.send(id);
                            }
                            Some(DriverCommand::Pause) => {}
                            // No step is awaiting approval while paused.
                            Some(DriverCommand::ApprovalDecision { .. }) => {}
                            None => break,
                        }
                    }
                }
                // Resuming while already running only makes sense with a
                // checkpoint id attached: the Supervisor uses this to
                // replay a recovered operation's last checkpoint right
                // after spawning its driver, before the main loop takes
                // its first ready-set snapshot.
                DriverCommand::Resume(Some(checkpoint_id)) => {
                    *state = self.restore_state(operation_id, checkpoint_id).await?;
                    self.publish(operation_id, OperationEventType::OperationResumed);
                }
                DriverCommand::Resume(None) => {} // no-op when not paused
                DriverCommand::Cancel { reason, compensate, force } => {
                    return Ok(Some(self.cancel_operation(operation_id, plan, completion_order, reason, compensate, force, cancel).await?));
                }
                DriverCommand::CreateCheckpoint { checkpoint_type, step_id, ack } => {
                    let id = self.checkpoint(operation_id, checkpoint_type, step_id, state).await?;
                    let _ = ack.send(id);
                }
                // No step is awaiting approval outside of `run_approval`'s
                // own wait loop; a decision arriving here is stale.
                DriverCommand::ApprovalDecision { .. } => {}
            }
        }
    }

    async fn cancel_operation(
        &self,
        operation_id: operon_types::OperationId,
        plan: &ExecutionPlan,
        completion_order: &[StepId],
        reason: String,
        compensate: bool,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<OperationStatus, OrchestratorError> {
        if force {
            cancel.cancel();
        }
        if compensate {
            let reverse: Vec<StepId> = completion_order.iter().rev().cloned().collect();
            let outcomes = run_compensation(&self.compensation_executor, plan, &reverse).await;
            for outcome in &outcomes {
                if let Some(error) = &outcome.error {
                    tracing::warn!(step_id = %outcome.step_id, error, "compensation failed during cancel");
                }
            }
        }
        self.state_store.update_operation_status(operation_id, OperationStatus::Cancelled, None, Some(Utc::now())).await?;
        self.publish(operation_id, OperationEventType::OperationCancelled);
        tracing::info!(operation_id = %operation_id, reason, "operation cancelled");
        Ok(OperationStatus::Cancelled)
    }

    async fn fail_operation(
        &self,
        operation_id: operon_types::OperationId,
        plan: &ExecutionPlan,
        completion_order: &[StepId],
        failed_step: StepId,
        _force: bool,
    ) -> Result<OperationStatus, OrchestratorError> {
        self.state_store.update_operation_status(operation_id, OperationStatus::Compensating, None, None).await?;

        let reverse: Vec<StepId> = completion_order.iter().rev().cloned().collect();
        let outcomes = run_compensation(&self.compensation_executor, plan, &reverse).await;
        for outcome in &outcomes {
            if let Some(error) = &outcome.error {
                tracing::warn!(step_id = %outcome.step_id, error, "compensation failed");
            }
        }

        self.state_store.update_operation_status(operation_id, OperationStatus::Failed, None, Some(Utc::now())).await?;
        self.publish(operation_id, OperationEventType::OperationFailed);
        Err(OrchestratorError::StepFailed { step_id: failed_step, error: "required step exhausted retries".to_string() })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_group(
        &self,
        group: &ParallelGroup,
        steps: Vec<&ExecutionStep>,
        state: &mut OperationState,
        default_retry: &RetryPolicy,
        cancel: &CancellationToken,
        completion_order: &mut Vec<StepId>,
        operation_id: operon_types::OperationId,
        instance_id: uuid::Uuid,
        step_runner: &StepRunner<SharedExecutor<E>>,
    ) -> Result<(), OrchestratorError> {
        let group_cancel = cancel.child_token();
        let max_concurrency = group.max_concurrency.max(1) as usize;
        let mut pending: Vec<&ExecutionStep> = steps;
        let mut group_results: Vec<(ExecutionStep, StepResult)> = Vec::new();

        while !pending.is_empty() {
            let batch: Vec<&ExecutionStep> = pending.drain(..pending.len().min(max_concurrency)).collect();
            let mut join_set: JoinSet<(ExecutionStep, StepResult)> = JoinSet::new();

            for step in batch {
                self.publish(operation_id, OperationEventType::StepStarted);
                let step_clone = step.clone();
                let mut local_vars = state.variables.clone();
                let policy = default_retry.clone();
                let token = group_cancel.clone();
                let runner_steps = step_runner.clone_handle();
                join_set.spawn(async move {
                    let result = runner_steps.run(&step_clone, &mut local_vars, &policy, &token).await;
                    (step_clone, result)
                });
            }

            let mut any_success = false;
            while let Some(joined) = join_set.join_next().await {
                let (step, result) = joined.expect("step task panicked");
                if matches!(result.status, StepStatus::Completed) {
                    any_success = true;
                    if group.execution_policy == ParallelExecutionPolicy::AnySuccess {
                        group_cancel.cancel();
                    }
                }
                if matches!(result.status, StepStatus::Failed) && group.execution_policy == ParallelExecutionPolicy::AllSuccess {
                    group_cancel.cancel();
                }
                group_results.push((step, result));
            }

            if group.execution_policy == ParallelExecutionPolicy::AnySuccess && any_success {
                break;
            }
        }

        // Merge outputs back in serially, after every member of this
        // batch has joined -- each task ran against its own clone of
        // `state.variables` (so concurrent members can't race on the same
        // map), but a downstream step's `inputMapping` still needs to see
        // what a completed member wrote.
        for (step, result) in group_results {
            if matches!(result.status, StepStatus::Completed) {
                crate::step_runner::apply_outputs(&step, &result.data, &mut state.variables);
            }
            self.apply_group_member_result(state, step.id.clone(), result, completion_order, operation_id, instance_id, group.failure_policy).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_group_member_result(
        &self,
        state: &mut OperationState,
        step_id: StepId,
        result: StepResult,
        completion_order: &mut Vec<StepId>,
        operation_id: operon_types::OperationId,
        instance_id: uuid::Uuid,
        failure_policy: FailurePolicy,
    ) -> Result<(), OrchestratorError> {
        self.state_store.save_step_result(instance_id, result.clone()).await?;
        match result.status {
            StepStatus::Completed => {
                state.completed_steps.insert(step_id.clone());
                completion_order.push(step_id.clone());
                self.publish(operation_id, OperationEventType::StepCompleted);
                self.checkpoint(operation_id, CheckpointType::ProgressMarker, Some(step_id), state).await?;
            }
            _ => {
                match failure_policy {
                    FailurePolicy::Continue | FailurePolicy::RetryFailed => {
                        state.completed_steps.insert(step_id.clone());
                    }
                    FailurePolicy::FailFast => {
                        state.failed_steps.insert(step_id.clone());
                    }
                }
                self.publish(operation_id, OperationEventType::StepFailed);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_result(
        &self,
        state: &mut OperationState,
        step: &ExecutionStep,
        result: StepResult,
        completion_order: &mut Vec<StepId>,
        operation_id: operon_types::OperationId,
        instance_id: uuid::Uuid,
        plan: &ExecutionPlan,
    ) -> Result<(), OrchestratorError> {
        self.state_store.save_step_result(instance_id, result.clone()).await?;
        match result.status {
            StepStatus::Completed => {
                state.completed_steps.insert(step.id.clone());
                completion_order.push(step.id.clone());
                self.publish(operation_id, OperationEventType::StepCompleted);
                if !matches!(step.step_type, operon_types::plan::StepType::Delay) {
                    self.checkpoint(operation_id, CheckpointType::ProgressMarker, Some(step.id.clone()), state).await?;
                }
                if plan.is_declared_checkpoint(&step.id) {
                    self.checkpoint(operation_id, CheckpointType::RecoveryPoint, Some(step.id.clone()), state).await?;
                }
            }
            _ => {
                state.failed_steps.insert(step.id.clone());
                self.publish(operation_id, OperationEventType::StepFailed);
            }
        }
        Ok(())
    }

    async fn checkpoint(
        &self,
        operation_id: operon_types::OperationId,
        checkpoint_type: CheckpointType,
        step_id: Option<StepId>,
        state: &mut OperationState,
    ) -> Result<CheckpointId, OrchestratorError> {
        let checkpoint_id = CheckpointId(state.checkpoints.len() as u64);
        state.checkpoints.push(checkpoint_id);
        let data = serde_json::to_value(&*state).map_err(|e| OrchestratorError::StateStore(crate::error::StateStoreError::Backend(e.to_string())))?;
        self.state_store
            .save_checkpoint(Checkpoint { id: checkpoint_id, operation_id, step_id, checkpoint_type, data, created_at: Utc::now() })
            .await?;
        self.publish(operation_id, OperationEventType::CheckpointCreated);
        self.sync_state(operation_id, state).await?;
        Ok(checkpoint_id)
    }

    async fn restore_state(&self, operation_id: operon_types::OperationId, checkpoint_id: CheckpointId) -> Result<OperationState, OrchestratorError> {
        let checkpoint = self.state_store.get_checkpoint(operation_id, checkpoint_id).await?;
        let state: OperationState =
            serde_json::from_value(checkpoint.data).map_err(|e| OrchestratorError::StateStore(crate::error::StateStoreError::Backend(e.to_string())))?;
        self.sync_state(operation_id, &state).await?;
        Ok(state)
    }

    /// Mirror `state` into the state store's CAS-protected row, so a
    /// concurrent reader (the Supervisor's `get_status`) sees progress
    /// without waiting on the next checkpoint. The single-writer-per-
    /// operation model means this never actually races; the compare in
    /// `update_state` is retried once against a freshly read version
    /// rather than escalated, since any loser here is this same driver
    /// observing its own prior write.
    async fn sync_state(&self, operation_id: operon_types::OperationId, state: &OperationState) -> Result<(), OrchestratorError> {
        let current = self.state_store.get_state(operation_id).await?;
        match self.state_store.update_state(operation_id, current.version, state.clone()).await {
            Ok(_) => Ok(()),
            Err(crate::error::StateStoreError::Conflict(_)) => {
                let retried = self.state_store.get_state(operation_id).await?;
                self.state_store.update_state(operation_id, retried.version, state.clone()).await?;
                Ok(())
            }
            Err(e) => Err(OrchestratorError::StateStore(e)),
        }
    }

    fn publish(&self, operation_id: operon_types::OperationId, event_type: OperationEventType) {
        self.event_bus.publish(OperationEvent::new(operation_id, event_type, &self.config.engine_id));
    }

    fn publish_with_data(&self, operation_id: operon_types::OperationId, event_type: OperationEventType, data: serde_json::Value) {
        self.event_bus.publish(OperationEvent::new(operation_id, event_type, &self.config.engine_id).with_data(data));
    }

    /// Suspend the driver on an `approval_request` step: publish
    /// `ApprovalRequested`, move status to `waiting_approval`, and block
    /// on the command channel until a matching `ApprovalDecision` (or a
    /// cancel) arrives. Pause/resume/checkpoint commands received while
    /// waiting are honored the same way the `drain_commands` pause loop
    /// honors them; they do not end the wait.
    async fn run_approval(
        &self,
        operation_id: operon_types::OperationId,
        plan: &ExecutionPlan,
        completion_order: &[StepId],
        step: &ExecutionStep,
        state: &mut OperationState,
        commands: &mut mpsc::UnboundedReceiver<DriverCommand>,
        cancel: &CancellationToken,
    ) -> Result<ApprovalOutcome, OrchestratorError> {
        let prompt = match &step.configuration {
            operon_types::plan::StepConfig::ApprovalRequest { prompt, .. } => prompt.clone(),
            _ => String::new(),
        };

        self.state_store.update_operation_status(operation_id, OperationStatus::WaitingApproval, None, None).await?;
        self.publish_with_data(
            operation_id,
            OperationEventType::ApprovalRequested,
            serde_json::json!({"step_id": step.id, "prompt": prompt}),
        );

        loop {
            match commands.recv().await {
                Some(DriverCommand::ApprovalDecision { step_id, approved }) if step_id == step.id => {
                    self.state_store.update_operation_status(operation_id, OperationStatus::Running, None, None).await?;
                    self.publish_with_data(
                        operation_id,
                        OperationEventType::ApprovalReceived,
                        serde_json::json!({"step_id": step.id, "approved": approved}),
                    );

                    let now = Utc::now();
                    let mut result = StepResult::pending(step.id.clone());
                    result.start_time = Some(now);
                    result.end_time = Some(now);
                    result.attempts = 1;
                    if approved {
                        result.status = StepStatus::Completed;
                    } else {
                        result.status = StepStatus::Failed;
                        result.errors.push(operon_types::RecordedError::new(operon_types::ErrorKind::StepFatal, "approval denied"));
                    }
                    return Ok(ApprovalOutcome::Decided(result));
                }
                // A decision for a different step id than the one we are
                // waiting on cannot happen in the single-writer model
                // (only one step is ever awaiting approval at a time for
                // a given operation), but is ignored rather than treated
                // as an error in case a stale/duplicate command arrives.
                Some(DriverCommand::ApprovalDecision { .. }) => {}
                Some(DriverCommand::Pause) => {
                    self.checkpoint(operation_id, CheckpointType::StateSnapshot, None, state).await?;
                }
                Some(DriverCommand::Resume(_)) => {}
                Some(DriverCommand::CreateCheckpoint { checkpoint_type, step_id, ack }) => {
                    let id = self.checkpoint(operation_id, checkpoint_type, step_id, state).await?;
                    let _ = ack.send(id);
                }
                Some(DriverCommand::Cancel { reason, compensate, force }) => {
                    let status = self.cancel_operation(operation_id, plan, completion_order, reason, compensate, force, cancel).await?;
                    return Ok(ApprovalOutcome::Cancelled(status));
                }
                None => return Ok(ApprovalOutcome::Cancelled(OperationStatus::Cancelled)),
            }
        }
    }
}

/// What waiting on an `approval_request` step resolved to.
enum ApprovalOutcome {
    Decided(StepResult),
    Cancelled(OperationStatus),
}

/// `shouldFailOperation` (§4.6.1): true if the step is required (whether
/// or not it carries a `CompensationStep` -- compensation is the
/// rollback run while `compensating`, not a reason to tolerate the
/// failure), or if it sits on a no-alternative critical path -- every
/// other plan step transitively depends on it, so no forward progress is
/// possible without it regardless of group policy.
fn should_fail_operation(plan: &ExecutionPlan, step_id: &str, failed_steps: &HashSet<StepId>) -> bool {
    let Some(step) = plan.step(step_id) else { return false };

    if step.required {
        return true;
    }

    let other_steps: Vec<&ExecutionStep> = plan.steps.iter().filter(|s| s.id != step_id).collect();
    if !other_steps.is_empty() && other_steps.iter().all(|s| transitively_depends_on(plan, &s.id, step_id)) {
        return true;
    }

    if let Some(group) = plan.group_for_step(step_id) {
        if group.execution_policy == ParallelExecutionPolicy::AllSuccess && group.failure_policy == FailurePolicy::FailFast {
            return failed_steps.contains(step_id);
        }
    }

    false
}

/// DFS over `plan.dependencies`, mirroring the source stack's transitive
/// dependency walk.
fn transitively_depends_on(plan: &ExecutionPlan, from: &str, target: &str) -> bool {
    let mut stack = vec![from.to_string()];
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        let Some(dep) = plan.dependencies.iter().find(|d| d.step_id == current) else { continue };
        for upstream in &dep.depends_on {
            if upstream == target {
                return true;
            }
            stack.push(upstream.clone());
        }
    }
    false
}

/// Cheap `Arc`-backed clone of a `StepExecutor` so a parallel group's
/// spawned tasks can each hold their own handle without cloning the
/// underlying executor.
struct SharedExecutor<E>(Arc<E>);

impl<E> Clone for SharedExecutor<E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<E: StepExecutor> StepExecutor for SharedExecutor<E> {
    async fn execute(
        &self,
        step: &ExecutionStep,
        params: &std::collections::HashMap<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<std::collections::HashMap<String, serde_json::Value>, crate::error::StepExecutorError> {
        self.0.execute(step, params, cancel).await
    }
}

impl<E: StepExecutor> StepRunner<SharedExecutor<E>> {
    fn clone_handle(&self) -> StepRunner<SharedExecutor<E>> {
        StepRunner::new(self.executor_handle().clone())
    }
}
