//! Step Runner: executes a single step via an external [`StepExecutor`],
//! applying input/output mapping, a per-step timeout, and retry/backoff.
//!
//! The Step Runner owns none of the actual step semantics -- running a
//! tool call, calling an API, generating an artifact -- that is the
//! `StepExecutor`'s job, supplied by the embedding application. This
//! module only owns the timeout/retry/cancellation envelope around it,
//! plus two deterministic test doubles used by the orchestrator's own
//! test suite.

use std::collections::HashMap;
use std::time::Duration;

use operon_types::error::ErrorKind;
use operon_types::execution_context::{BackoffStrategy, RetryPolicy};
use operon_types::ids::StepId;
use operon_types::plan::ExecutionStep;
use operon_types::result::{StepResult, StepStatus};
use operon_types::RecordedError;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::StepExecutorError;

/// The external capability this engine orchestrates but never implements
/// itself: actually running a step's tool call / API request / artifact
/// generation. Supplied by the embedding application.
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &ExecutionStep,
        params: &HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>, StepExecutorError>;
}

/// Always returns the same pre-programmed outcome for every step. Useful
/// for exercising the timeout/retry envelope in isolation.
pub struct StaticStepExecutor {
    outcome: Result<HashMap<String, Value>, StepExecutorError>,
}

impl StaticStepExecutor {
    pub fn always_succeed(data: HashMap<String, Value>) -> Self {
        Self { outcome: Ok(data) }
    }

    pub fn always_fail(error: StepExecutorError) -> Self {
        Self { outcome: Err(error) }
    }
}

impl StepExecutor for StaticStepExecutor {
    async fn execute(
        &self,
        _step: &ExecutionStep,
        _params: &HashMap<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>, StepExecutorError> {
        self.outcome.clone()
    }
}

/// A per-step-id queue of outcomes, consumed one at a time across
/// successive invocations -- lets a test script "fail twice then
/// succeed" for a given step id.
#[derive(Default)]
pub struct ScriptedStepExecutor {
    scripts: dashmap::DashMap<StepId, std::sync::Mutex<Vec<Result<HashMap<String, Value>, StepExecutorError>>>>,
}

impl ScriptedStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes are consumed front-to-back in the order given.
    pub fn script(&self, step_id: impl Into<StepId>, outcomes: Vec<Result<HashMap<String, Value>, StepExecutorError>>) {
        let mut outcomes = outcomes;
        outcomes.reverse();
        self.scripts.insert(step_id.into(), std::sync::Mutex::new(outcomes));
    }
}

impl StepExecutor for ScriptedStepExecutor {
    async fn execute(
        &self,
        step: &ExecutionStep,
        _params: &HashMap<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<HashMap<String, Value>, StepExecutorError> {
        let queue = self.scripts.get(&step.id).unwrap_or_else(|| panic!("no script registered for step {}", step.id));
        let mut queue = queue.lock().expect("scripted executor mutex poisoned");
        queue.pop().unwrap_or_else(|| panic!("script exhausted for step {}", step.id))
    }
}

/// Stateless retry/backoff math. `attempt` is 1-based: the count of
/// tries already made, including the one that just failed.
pub struct RetryHandler;

impl RetryHandler {
    /// `true` iff the error is in the policy's retryable list (or the
    /// list is empty, meaning every error is retryable) and `attempt`
    /// has not exhausted `max_attempts`. An empty `retryable_errors` list
    /// is the common case: most callers don't bother allow-listing error
    /// strings and expect every failure to be retried up to the cap.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &str) -> bool {
        let is_retryable = policy.retryable_errors.is_empty() || policy.retryable_errors.iter().any(|e| e == error);
        is_retryable && attempt <= policy.max_attempts
    }

    /// The delay before the next attempt, given the attempt that just
    /// failed (1-based).
    pub fn delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let millis = match policy.backoff_strategy {
            BackoffStrategy::Linear => (policy.base_delay_ms.saturating_mul(attempt as u64)).min(policy.max_delay_ms),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                policy.base_delay_ms.saturating_mul(factor).min(policy.max_delay_ms)
            }
            BackoffStrategy::Custom => {
                if policy.max_attempts == 0 {
                    policy.base_delay_ms
                } else {
                    let span = policy.max_delay_ms.saturating_sub(policy.base_delay_ms);
                    let step = span / policy.max_attempts.max(1) as u64;
                    (policy.base_delay_ms + step.saturating_mul(attempt as u64)).min(policy.max_delay_ms)
                }
            }
        };
        Duration::from_millis(millis)
    }
}

/// Drives a single step through input resolution, timeout, and retry.
pub struct StepRunner<E: StepExecutor> {
    executor: E,
}

impl<E: StepExecutor> StepRunner<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    /// Borrow the underlying executor handle, for callers (the
    /// Orchestrator's parallel-group dispatch) that need their own cheap
    /// clone of it rather than of the whole `StepRunner`.
    pub fn executor_handle(&self) -> &E {
        &self.executor
    }

    /// Resolve `step.input_mapping` against `variables`, run the step
    /// (retrying on failure per its retry policy, or `default_retry` if
    /// the step specifies none), apply `step.output_mapping` into
    /// `variables`, and return the terminal [`StepResult`].
    ///
    /// Honors `cancel` both during execution and during the inter-attempt
    /// backoff sleep.
    pub async fn run(
        &self,
        step: &ExecutionStep,
        variables: &mut HashMap<String, Value>,
        default_retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> StepResult {
        let policy = step.retry_policy.as_ref().unwrap_or(default_retry);
        let start_time = chrono::Utc::now();

        let params = match resolve_inputs(step, variables) {
            Ok(params) => params,
            Err(missing) => {
                return terminal(
                    step,
                    StepStatus::Failed,
                    1,
                    start_time,
                    vec![RecordedError::new(ErrorKind::StepFatal, format!("missing required input variable: {missing}"))],
                );
            }
        };
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return terminal(step, StepStatus::Failed, attempt, start_time, vec![RecordedError::new(ErrorKind::StepCancelled, "cancelled before execution")]);
            }

            let run_result = match step.timeout_secs {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs(secs), self.executor.execute(step, &params, cancel)).await {
                        Ok(inner) => inner,
                        Err(_) => Err(StepExecutorError::Timeout(format!("step timed out after {secs}s"))),
                    }
                }
                None => self.executor.execute(step, &params, cancel).await,
            };

            match run_result {
                Ok(data) => {
                    apply_outputs(step, &data, variables);
                    let mut result = terminal(step, StepStatus::Completed, attempt, start_time, vec![]);
                    result.data = data;
                    return result;
                }
                Err(error) => {
                    let message = error.to_string();
                    if RetryHandler::should_retry(policy, attempt, &message) {
                        let delay = RetryHandler::delay(policy, attempt);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                return terminal(step, StepStatus::Failed, attempt, start_time, vec![RecordedError::new(ErrorKind::StepCancelled, "cancelled during retry backoff")]);
                            }
                        }
                        continue;
                    }
                    let kind = match error {
                        StepExecutorError::Cancelled => ErrorKind::StepCancelled,
                        StepExecutorError::Timeout(_) => ErrorKind::StepTimeout,
                        StepExecutorError::Failed(_) => ErrorKind::StepFatal,
                    };
                    return terminal(step, StepStatus::Failed, attempt, start_time, vec![RecordedError::new(kind, message)]);
                }
            }
        }
    }
}

/// Resolve `step.input_mapping` against `variables`. Every mapped
/// variable is required; the first missing one is returned as `Err` so
/// the caller can fail the step without invoking the executor at all.
fn resolve_inputs(step: &ExecutionStep, variables: &HashMap<String, Value>) -> Result<HashMap<String, Value>, String> {
    let mut params = HashMap::with_capacity(step.input_mapping.len());
    for (variable_name, param_name) in &step.input_mapping {
        let Some(value) = variables.get(variable_name) else {
            return Err(variable_name.clone());
        };
        params.insert(param_name.clone(), value.clone());
    }
    Ok(params)
}

pub(crate) fn apply_outputs(step: &ExecutionStep, data: &HashMap<String, Value>, variables: &mut HashMap<String, Value>) {
    for (result_key, variable_name) in &step.output_mapping {
        if let Some(value) = data.get(result_key) {
            variables.insert(variable_name.clone(), value.clone());
        }
    }
}

fn terminal(step: &ExecutionStep, status: StepStatus, attempts: u32, start_time: chrono::DateTime<chrono::Utc>, errors: Vec<RecordedError>) -> StepResult {
    StepResult {
        step_id: step.id.clone(),
        status,
        data: HashMap::new(),
        errors,
        start_time: Some(start_time),
        end_time: Some(chrono::Utc::now()),
        attempts,
    }
}
