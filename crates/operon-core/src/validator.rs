//! Structural and semantic validation of a submitted `Operation`.
//!
//! `validate` is pure: calling it twice on the same input yields the same
//! result, and rejection is total -- there is no partial acceptance. The
//! algorithm is one structural pass over fields followed by one
//! topological pass over steps (Kahn's algorithm) that detects cycles and
//! produces a deterministic execution order by `(order, id)`.

use std::collections::{HashMap, HashSet, VecDeque};

use operon_types::{ExecutionStep, Operation};

use crate::error::ValidationError;

/// Validate an operation's plan against the engine's configured maximum
/// operation timeout. Returns the deterministic `(order, id)` execution
/// order on success, or the first structural violation found.
///
/// The structural pass runs before the topological pass: an operation
/// with both a duplicate step id and a cycle is rejected for the
/// duplicate id, since the topological pass cannot be trusted to run
/// over malformed input.
pub fn validate(operation: &Operation, operation_timeout_max_secs: u64) -> Result<Vec<String>, ValidationError> {
    validate_structure(operation, operation_timeout_max_secs)?;
    topological_order(operation)
}

fn validate_structure(operation: &Operation, operation_timeout_max_secs: u64) -> Result<(), ValidationError> {
    let plan = &operation.plan;

    if plan.steps.is_empty() {
        return Err(ValidationError::EmptyPlan);
    }

    if !operation.context.execution.resource_limits.is_positive() {
        return Err(ValidationError::NonPositiveResourceLimit);
    }

    if operation.context.execution.timeout_secs > operation_timeout_max_secs {
        return Err(ValidationError::TimeoutExceedsMaximum {
            given: operation.context.execution.timeout_secs,
            max: operation_timeout_max_secs,
        });
    }

    if !operation.context.execution.retry_policy.is_valid() {
        return Err(ValidationError::InvalidRetryPolicy { step_id: "<default>".to_string() });
    }

    let mut seen_ids = HashSet::new();
    let mut step_ids = HashSet::new();
    for step in &plan.steps {
        if !seen_ids.insert(step.id.clone()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
        step_ids.insert(step.id.clone());

        if step.configuration.step_type() != step.step_type {
            return Err(ValidationError::ParameterTypeMismatch {
                step_id: step.id.clone(),
                detail: "configuration variant does not match declared step_type".to_string(),
            });
        }

        if let Some(policy) = &step.retry_policy {
            if !policy.is_valid() {
                return Err(ValidationError::InvalidRetryPolicy { step_id: step.id.clone() });
            }
        }
    }

    for dep in &plan.dependencies {
        if !step_ids.contains(&dep.step_id) {
            return Err(ValidationError::UnknownStepId(dep.step_id.clone()));
        }
        for upstream in &dep.depends_on {
            if !step_ids.contains(upstream) {
                return Err(ValidationError::UnknownStepId(upstream.clone()));
            }
        }
    }

    for checkpoint_step_id in &plan.checkpoints {
        if !step_ids.contains(checkpoint_step_id) {
            return Err(ValidationError::CheckpointMissingStep(checkpoint_step_id.clone()));
        }
    }

    let mut grouped: HashSet<String> = HashSet::new();
    for group in &plan.parallel_groups {
        if group.step_ids.len() < 2 {
            return Err(ValidationError::ParallelGroupTooSmall { group: group.id.clone() });
        }
        for step_id in &group.step_ids {
            if !step_ids.contains(step_id) {
                return Err(ValidationError::UnknownStepId(step_id.clone()));
            }
            if !grouped.insert(step_id.clone()) {
                return Err(ValidationError::StepInMultipleGroups(step_id.clone()));
            }
        }
    }

    Ok(())
}

/// Kahn's algorithm over the step DAG: detects cycles and returns step ids
/// in a deterministic `(order, id)`-tie-broken topological order.
fn topological_order(operation: &Operation) -> Result<Vec<String>, ValidationError> {
    let plan = &operation.plan;

    let mut in_degree: HashMap<&str, usize> = plan.steps.iter().map(|s| (s.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for dep in &plan.dependencies {
        for upstream in &dep.depends_on {
            dependents.entry(upstream.as_str()).or_default().push(dep.step_id.as_str());
            *in_degree.get_mut(dep.step_id.as_str()).expect("validated above") += 1;
        }
    }

    // Stable ordering: seed the frontier sorted by (order, id), and keep it
    // sorted as nodes are unlocked, so ties resolve deterministically.
    let order_of: HashMap<&str, u32> = plan.steps.iter().map(|s| (s.id.as_str(), s.order)).collect();

    let mut frontier: Vec<&str> = in_degree.iter().filter(|(_, deg)| **deg == 0).map(|(id, _)| *id).collect();
    frontier.sort_by_key(|id| (order_of[id], *id));

    let mut queue: VecDeque<&str> = frontier.into();
    let mut result = Vec::with_capacity(plan.steps.len());

    while let Some(id) = queue.pop_front() {
        result.push(id.to_string());

        if let Some(children) = dependents.get(id) {
            let mut newly_ready = Vec::new();
            for child in children {
                let degree = in_degree.get_mut(child).expect("validated above");
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(*child);
                }
            }
            newly_ready.sort_by_key(|cid| (order_of[cid], *cid));
            for cid in newly_ready {
                // Insert keeping overall queue order deterministic enough
                // for replay purposes: ties within a single unlock batch
                // are already sorted, and batches are processed FIFO.
                queue.push_back(cid);
            }
        }
    }

    if result.len() != plan.steps.len() {
        let stuck = plan
            .steps
            .iter()
            .find(|s| !result.contains(&s.id))
            .map(|s| s.id.clone())
            .unwrap_or_default();
        return Err(ValidationError::CycleDetected(stuck));
    }

    Ok(result)
}

/// `(order, id)` comparator used by the Plan Analyzer's tie-breaking rule.
pub fn order_key(step: &ExecutionStep) -> (u32, &str) {
    (step.order, step.id.as_str())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use operon_types::execution_context::{ExecutionMode, Priority, ResourceLimits, RetryPolicy};
    use operon_types::operation::{Environment, OperationContext, OperationMetadata, OperationStatus, OperationType, RiskLevel, SecurityContext};
    use operon_types::plan::{DependencyType, ExecutionPlan, ParallelExecutionPolicy, ParallelGroup, StepConfig, StepDependency, StepType};
    use operon_types::{ExecutionContext, ExecutionStep, OperationId};

    use super::*;

    fn make_step(id: &str, order: u32) -> ExecutionStep {
        ExecutionStep {
            id: id.to_string(),
            name: id.to_string(),
            order,
            step_type: StepType::ToolCall,
            configuration: StepConfig::ToolCall { tool: "noop".to_string(), params: serde_json::Value::Null },
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            condition: None,
            timeout_secs: None,
            retry_policy: None,
            compensation: None,
            required: true,
        }
    }

    fn make_operation(steps: Vec<ExecutionStep>, dependencies: Vec<StepDependency>, groups: Vec<ParallelGroup>) -> Operation {
        Operation {
            id: OperationId::new(),
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
            plan: ExecutionPlan { steps, dependencies, parallel_groups: groups, checkpoints: vec![] },
            metadata: OperationMetadata::default(),
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_secs: None,
            actual_duration_secs: None,
        }
    }

    #[test]
    fn rejects_empty_plan() {
        let op = make_operation(vec![], vec![], vec![]);
        assert!(matches!(validate(&op, 1800), Err(ValidationError::EmptyPlan)));
    }

    #[test]
    fn rejects_timeout_above_configured_maximum() {
        let mut op = make_operation(vec![make_step("s1", 0)], vec![], vec![]);
        op.context.execution.timeout_secs = 3600;
        assert!(matches!(
            validate(&op, 1800),
            Err(ValidationError::TimeoutExceedsMaximum { given: 3600, max: 1800 })
        ));
    }

    #[test]
    fn rejects_duplicate_step_id() {
        let op = make_operation(vec![make_step("s1", 0), make_step("s1", 1)], vec![], vec![]);
        assert!(matches!(validate(&op, 1800), Err(ValidationError::DuplicateStepId(_))));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let op = make_operation(
            vec![make_step("s1", 0)],
            vec![StepDependency { step_id: "s1".to_string(), depends_on: vec!["ghost".to_string()], dependency_type: DependencyType::Sequential }],
            vec![],
        );
        assert!(matches!(validate(&op, 1800), Err(ValidationError::UnknownStepId(_))));
    }

    #[test]
    fn rejects_cycle() {
        let op = make_operation(
            vec![make_step("s1", 0), make_step("s2", 1)],
            vec![
                StepDependency { step_id: "s1".to_string(), depends_on: vec!["s2".to_string()], dependency_type: DependencyType::Sequential },
                StepDependency { step_id: "s2".to_string(), depends_on: vec!["s1".to_string()], dependency_type: DependencyType::Sequential },
            ],
            vec![],
        );
        assert!(matches!(validate(&op, 1800), Err(ValidationError::CycleDetected(_))));
    }

    #[test]
    fn accepts_linear_chain_in_order() {
        let op = make_operation(
            vec![make_step("s1", 0), make_step("s2", 1), make_step("s3", 2)],
            vec![
                StepDependency { step_id: "s2".to_string(), depends_on: vec!["s1".to_string()], dependency_type: DependencyType::Sequential },
                StepDependency { step_id: "s3".to_string(), depends_on: vec!["s2".to_string()], dependency_type: DependencyType::Sequential },
            ],
            vec![],
        );
        let order = validate(&op, 1800).unwrap();
        assert_eq!(order, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn rejects_parallel_group_below_two_members() {
        let op = make_operation(
            vec![make_step("s1", 0)],
            vec![],
            vec![ParallelGroup {
                id: "g1".to_string(),
                step_ids: vec!["s1".to_string()],
                execution_policy: ParallelExecutionPolicy::AllSuccess,
                max_concurrency: 1,
                failure_policy: operon_types::plan::FailurePolicy::FailFast,
            }],
        );
        assert!(matches!(validate(&op, 1800), Err(ValidationError::ParallelGroupTooSmall { .. })));
    }

    #[test]
    fn rejects_step_with_invalid_retry_policy() {
        let mut s = make_step("s1", 0);
        s.retry_policy = Some(RetryPolicy { max_attempts: 3, backoff_strategy: operon_types::execution_context::BackoffStrategy::Linear, base_delay_ms: 100, max_delay_ms: 50, retryable_errors: vec![] });
        let op = make_operation(vec![s], vec![], vec![]);
        assert!(matches!(validate(&op, 1800), Err(ValidationError::InvalidRetryPolicy { .. })));
    }

    #[test]
    fn rejects_checkpoint_referencing_missing_step() {
        let mut op = make_operation(vec![make_step("s1", 0)], vec![], vec![]);
        op.plan.checkpoints.push("ghost".to_string());
        assert!(matches!(validate(&op, 1800), Err(ValidationError::CheckpointMissingStep(_))));
    }

    #[test]
    fn rejects_step_in_two_groups() {
        let op = make_operation(
            vec![make_step("s1", 0), make_step("s2", 1), make_step("s3", 2)],
            vec![],
            vec![
                ParallelGroup {
                    id: "g1".to_string(),
                    step_ids: vec!["s1".to_string(), "s2".to_string()],
                    execution_policy: ParallelExecutionPolicy::AllSuccess,
                    max_concurrency: 2,
                    failure_policy: operon_types::plan::FailurePolicy::FailFast,
                },
                ParallelGroup {
                    id: "g2".to_string(),
                    step_ids: vec!["s1".to_string(), "s3".to_string()],
                    execution_policy: ParallelExecutionPolicy::AllSuccess,
                    max_concurrency: 2,
                    failure_policy: operon_types::plan::FailurePolicy::FailFast,
                },
            ],
        );
        assert!(matches!(validate(&op, 1800), Err(ValidationError::StepInMultipleGroups(_))));
    }
}
