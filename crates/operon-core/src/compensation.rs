//! Saga-style compensation: undo completed steps in reverse completion
//! order when an operation fails.
//!
//! Compensation is best-effort: a failing compensation action is logged
//! and does not block running the rest of the reverse sequence, since by
//! the time compensation runs the operation is already headed to
//! `failed` and the priority is undoing as much as possible rather than
//! stopping at the first compensation error.

use operon_types::plan::CompensationStep;
use operon_types::ids::StepId;

/// The external capability that performs a single compensation action.
/// Supplied by the embedding application, same as [`crate::step_runner::StepExecutor`].
pub trait CompensationExecutor: Send + Sync {
    async fn compensate(&self, compensation: &CompensationStep) -> Result<(), String>;
}

/// Never compensates; every call reports a failure. Useful for exercising
/// the "compensation failed, continue anyway" path in tests, and as the
/// Supervisor's default when an embedding application declines to wire one
/// in -- `Clone` so it can be handed to every spawned driver without an
/// `Arc`.
#[derive(Clone)]
pub struct NoopCompensationExecutor;

impl CompensationExecutor for NoopCompensationExecutor {
    async fn compensate(&self, _compensation: &CompensationStep) -> Result<(), String> {
        Err("no compensation executor configured".to_string())
    }
}

/// The outcome of compensating one step.
#[derive(Debug, Clone)]
pub struct CompensationOutcome {
    pub step_id: StepId,
    pub error: Option<String>,
}

/// Run compensation for `completed_step_ids` (already in reverse
/// completion order -- the caller owns that ordering since it knows the
/// actual completion timestamps) against `plan`, skipping steps with no
/// `compensation` configured. Tolerates individual failures.
pub async fn run_compensation<C: CompensationExecutor>(
    executor: &C,
    plan: &operon_types::plan::ExecutionPlan,
    completed_step_ids_reverse_order: &[StepId],
) -> Vec<CompensationOutcome> {
    let mut outcomes = Vec::new();
    for step_id in completed_step_ids_reverse_order {
        let Some(step) = plan.step(step_id) else { continue };
        let Some(compensation) = &step.compensation else { continue };

        let result = executor.compensate(compensation).await;
        let error = result.err().inspect(|e| {
            tracing::warn!(step_id = %step_id, error = %e, "compensation failed, continuing");
        });
        outcomes.push(CompensationOutcome { step_id: step_id.clone(), error });
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use operon_types::plan::{CompensationStep, ExecutionPlan, ExecutionStep, StepConfig, StepType};
    use serde_json::Value;

    use super::*;

    struct RecordingExecutor {
        calls: std::sync::Mutex<Vec<StepId>>,
        fail_for: Vec<StepId>,
    }

    impl CompensationExecutor for RecordingExecutor {
        async fn compensate(&self, compensation: &CompensationStep) -> Result<(), String> {
            self.calls.lock().unwrap().push(compensation.id.clone());
            if self.fail_for.contains(&compensation.id) {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn step_with_compensation(id: &str) -> ExecutionStep {
        ExecutionStep {
            id: id.to_string(),
            name: id.to_string(),
            order: 0,
            step_type: StepType::ToolCall,
            configuration: StepConfig::ToolCall { tool: "noop".to_string(), params: Value::Null },
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            condition: None,
            timeout_secs: None,
            retry_policy: None,
            compensation: Some(CompensationStep {
                id: format!("undo-{id}"),
                configuration: StepConfig::ToolCall { tool: "noop-undo".to_string(), params: Value::Null },
                timeout_secs: None,
            }),
            required: true,
        }
    }

    #[tokio::test]
    async fn compensates_in_the_given_order_and_skips_steps_without_compensation() {
        let mut plan = ExecutionPlan::default();
        plan.steps.push(step_with_compensation("a"));
        plan.steps.push(step_with_compensation("b"));

        let executor = RecordingExecutor { calls: std::sync::Mutex::new(Vec::new()), fail_for: vec![] };
        let outcomes = run_compensation(&executor, &plan, &["b".to_string(), "a".to_string()]).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(*executor.calls.lock().unwrap(), vec!["undo-b".to_string(), "undo-a".to_string()]);
    }

    #[tokio::test]
    async fn a_failing_compensation_does_not_stop_the_rest() {
        let mut plan = ExecutionPlan::default();
        plan.steps.push(step_with_compensation("a"));
        plan.steps.push(step_with_compensation("b"));

        let executor = RecordingExecutor { calls: std::sync::Mutex::new(Vec::new()), fail_for: vec!["undo-b".to_string()] };
        let outcomes = run_compensation(&executor, &plan, &["b".to_string(), "a".to_string()]).await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].error.is_some());
        assert!(outcomes[1].error.is_none());
    }

    #[tokio::test]
    async fn steps_without_compensation_are_skipped_silently() {
        let mut plan = ExecutionPlan::default();
        let mut no_comp = step_with_compensation("a");
        no_comp.compensation = None;
        plan.steps.push(no_comp);

        let calls = AtomicUsize::new(0);
        struct Counting<'a>(&'a AtomicUsize);
        impl CompensationExecutor for Counting<'_> {
            async fn compensate(&self, _compensation: &CompensationStep) -> Result<(), String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let executor = Counting(&calls);
        let outcomes = run_compensation(&executor, &plan, &["a".to_string()]).await;
        assert!(outcomes.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
