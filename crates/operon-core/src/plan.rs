//! Plan Analyzer: computes the ready set over a step DAG given progress so far.

use std::collections::{HashMap, HashSet};

use operon_types::{ExecutionPlan, ExecutionStep, OperationState, ParallelGroup, StepId};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde_json::Value;

use crate::error::PlanError;

/// A batch of steps the orchestrator may dispatch together: either a
/// singleton with no group membership, or all currently-ready members of
/// a [`ParallelGroup`].
#[derive(Debug, Clone)]
pub enum ReadyBatch<'a> {
    Single(&'a ExecutionStep),
    Group { group: &'a ParallelGroup, steps: Vec<&'a ExecutionStep> },
}

impl<'a> ReadyBatch<'a> {
    /// `(order, id)` used to order batches deterministically: for a group,
    /// the minimum over its ready members.
    fn sort_key(&self) -> (u32, &'a str) {
        match self {
            ReadyBatch::Single(step) => (step.order, step.id.as_str()),
            ReadyBatch::Group { steps, .. } => {
                steps.iter().map(|s| (s.order, s.id.as_str())).min().expect("group batches are never empty")
            }
        }
    }
}

/// The result of a single `ready_set` call. `newly_skipped` lists steps
/// whose condition evaluated false; the caller (the Orchestrator) folds
/// these into `OperationState.completed_steps` before calling again, since
/// this function never mutates state itself.
#[derive(Debug, Default)]
pub struct ReadySet<'a> {
    pub batches: Vec<ReadyBatch<'a>>,
    pub newly_skipped: Vec<StepId>,
}

impl ReadySet<'_> {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Evaluates a step's optional guard condition against the operation's
/// current variables. Kept as a trait so the Plan Analyzer has no direct
/// dependency on the expression engine; see `crate::condition` for the
/// JEXL-backed implementation.
pub trait ConditionEvaluator {
    fn evaluate(&self, expression: &str, variables: &HashMap<String, Value>) -> Result<bool, PlanError>;
}

/// Compute the ready set: which steps may start given `state`'s progress,
/// `currently_running` steps already dispatched by a prior call, and the
/// plan's DAG and parallel-group structure.
///
/// A step is ready iff it is not already completed, failed, or running;
/// every upstream dependency is completed; and its condition (if any)
/// evaluates true. A false condition resolves the step as skipped here
/// (never invoking the Step Runner) and is reported via
/// `ReadySet::newly_skipped` rather than applied directly.
pub fn ready_set<'a>(
    plan: &'a ExecutionPlan,
    state: &OperationState,
    currently_running: &HashSet<StepId>,
    evaluator: &dyn ConditionEvaluator,
) -> Result<ReadySet<'a>, PlanError> {
    let mut candidates: Vec<&ExecutionStep> = Vec::new();
    let mut newly_skipped = Vec::new();

    for step in &plan.steps {
        if state.completed_steps.contains(&step.id)
            || state.failed_steps.contains(&step.id)
            || currently_running.contains(&step.id)
        {
            continue;
        }

        let deps_satisfied = plan
            .dependencies
            .iter()
            .filter(|dep| dep.step_id == step.id)
            .all(|dep| dep.depends_on.iter().all(|upstream| state.completed_steps.contains(upstream)));
        if !deps_satisfied {
            continue;
        }

        if let Some(condition) = &step.condition {
            let met = evaluator.evaluate(&condition.expression, &state.variables).unwrap_or(condition.default);
            if !met {
                newly_skipped.push(step.id.clone());
                continue;
            }
        }

        candidates.push(step);
    }

    let mut batches: Vec<ReadyBatch<'a>> = Vec::new();
    let mut seen_groups: HashSet<&str> = HashSet::new();

    for step in &candidates {
        match plan.group_for_step(&step.id) {
            Some(group) if seen_groups.insert(group.id.as_str()) => {
                let members: Vec<&ExecutionStep> =
                    candidates.iter().copied().filter(|s| group.step_ids.iter().any(|id| id == &s.id)).collect();
                batches.push(ReadyBatch::Group { group, steps: members });
            }
            Some(_) => {} // already folded into its group's batch above
            None => batches.push(ReadyBatch::Single(step)),
        }
    }

    batches.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    Ok(ReadySet { batches, newly_skipped })
}

/// Decompose `plan`'s dependency DAG into waves: groups of step ids where
/// every step in wave N depends only on steps in waves `0..N`. Unlike
/// [`ready_set`], this ignores conditions and current progress -- it is
/// the static shape the Orchestrator consults for dispatch-concurrency
/// planning and for the deadlock-vs-condition-skip diagnostic, not the
/// live per-call ready computation.
pub fn waves(plan: &ExecutionPlan) -> Result<Vec<Vec<StepId>>, PlanError> {
    if plan.steps.is_empty() {
        return Ok(vec![]);
    }

    let id_to_idx: HashMap<&str, usize> = plan.steps.iter().enumerate().map(|(i, s)| (s.id.as_str(), i)).collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = plan.steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    let mut depends_on: HashMap<&str, Vec<&str>> = HashMap::new();
    for dep in &plan.dependencies {
        depends_on.entry(dep.step_id.as_str()).or_default().extend(dep.depends_on.iter().map(|s| s.as_str()));
        for upstream in &dep.depends_on {
            let from = id_to_idx[upstream.as_str()];
            let to = id_to_idx[dep.step_id.as_str()];
            graph.add_edge(node_indices[from], node_indices[to], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        PlanError::Validation(crate::error::ValidationError::CycleDetected(node_id.to_string()))
    })?;

    let mut depth: HashMap<&str, usize> = HashMap::new();
    for node_idx in &sorted {
        let step_id = graph[*node_idx];
        let d = depends_on
            .get(step_id)
            .map(|ups| ups.iter().map(|u| depth.get(u).copied().unwrap_or(0) + 1).max().unwrap_or(0))
            .unwrap_or(0);
        depth.insert(step_id, d);
    }

    let max_depth = depth.values().copied().max().unwrap_or(0);
    let mut result: Vec<Vec<StepId>> = vec![Vec::new(); max_depth + 1];
    for step in &plan.steps {
        result[depth[step.id.as_str()]].push(step.id.clone());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use operon_types::plan::{DependencyType, FailurePolicy, ParallelExecutionPolicy, StepCondition, StepConfig, StepDependency, StepType};
    use operon_types::OperationId;

    use super::*;

    struct AlwaysTrue;
    impl ConditionEvaluator for AlwaysTrue {
        fn evaluate(&self, _expression: &str, _variables: &HashMap<String, Value>) -> Result<bool, PlanError> {
            Ok(true)
        }
    }

    struct AlwaysFalse;
    impl ConditionEvaluator for AlwaysFalse {
        fn evaluate(&self, _expression: &str, _variables: &HashMap<String, Value>) -> Result<bool, PlanError> {
            Ok(false)
        }
    }

    fn step(id: &str, order: u32) -> ExecutionStep {
        ExecutionStep {
            id: id.to_string(),
            name: id.to_string(),
            order,
            step_type: StepType::ToolCall,
            configuration: StepConfig::ToolCall { tool: "noop".to_string(), params: Value::Null },
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            condition: None,
            timeout_secs: None,
            retry_policy: None,
            compensation: None,
            required: true,
        }
    }

    fn state() -> OperationState {
        OperationState::new(OperationId::new())
    }

    #[test]
    fn independent_steps_are_each_singleton_batches_in_order() {
        let plan = ExecutionPlan { steps: vec![step("b", 1), step("a", 0)], dependencies: vec![], parallel_groups: vec![], checkpoints: vec![] };
        let result = ready_set(&plan, &state(), &HashSet::new(), &AlwaysTrue).unwrap();
        assert_eq!(result.batches.len(), 2);
        assert!(matches!(result.batches[0], ReadyBatch::Single(s) if s.id == "a"));
        assert!(matches!(result.batches[1], ReadyBatch::Single(s) if s.id == "b"));
    }

    #[test]
    fn blocked_step_is_not_ready_until_dependency_completes() {
        let plan = ExecutionPlan {
            steps: vec![step("a", 0), step("b", 1)],
            dependencies: vec![StepDependency { step_id: "b".to_string(), depends_on: vec!["a".to_string()], dependency_type: DependencyType::Sequential }],
            parallel_groups: vec![],
            checkpoints: vec![],
        };
        let mut st = state();
        let result = ready_set(&plan, &st, &HashSet::new(), &AlwaysTrue).unwrap();
        assert_eq!(result.batches.len(), 1);
        assert!(matches!(result.batches[0], ReadyBatch::Single(s) if s.id == "a"));

        st.completed_steps.insert("a".to_string());
        let result = ready_set(&plan, &st, &HashSet::new(), &AlwaysTrue).unwrap();
        assert_eq!(result.batches.len(), 1);
        assert!(matches!(result.batches[0], ReadyBatch::Single(s) if s.id == "b"));
    }

    #[test]
    fn false_condition_reports_skip_without_a_batch() {
        let mut s = step("a", 0);
        s.condition = Some(StepCondition { expression: "false".to_string(), default: false });
        let plan = ExecutionPlan { steps: vec![s], dependencies: vec![], parallel_groups: vec![], checkpoints: vec![] };
        let result = ready_set(&plan, &state(), &HashSet::new(), &AlwaysFalse).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.newly_skipped, vec!["a".to_string()]);
    }

    #[test]
    fn ready_group_members_surface_as_one_batch() {
        let plan = ExecutionPlan {
            steps: vec![step("a", 0), step("b", 1), step("c", 2)],
            dependencies: vec![],
            parallel_groups: vec![ParallelGroup {
                id: "g1".to_string(),
                step_ids: vec!["a".to_string(), "b".to_string()],
                execution_policy: ParallelExecutionPolicy::AllSuccess,
                max_concurrency: 2,
                failure_policy: FailurePolicy::FailFast,
            }],
            checkpoints: vec![],
        };
        let result = ready_set(&plan, &state(), &HashSet::new(), &AlwaysTrue).unwrap();
        assert_eq!(result.batches.len(), 2);
        match &result.batches[0] {
            ReadyBatch::Group { group, steps } => {
                assert_eq!(group.id, "g1");
                assert_eq!(steps.len(), 2);
            }
            _ => panic!("expected group batch first"),
        }
        assert!(matches!(result.batches[1], ReadyBatch::Single(s) if s.id == "c"));
    }

    #[test]
    fn currently_running_steps_are_excluded() {
        let plan = ExecutionPlan { steps: vec![step("a", 0)], dependencies: vec![], parallel_groups: vec![], checkpoints: vec![] };
        let mut running = HashSet::new();
        running.insert("a".to_string());
        let result = ready_set(&plan, &state(), &running, &AlwaysTrue).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn waves_groups_a_diamond_into_three_levels() {
        let plan = ExecutionPlan {
            steps: vec![step("a", 0), step("b", 1), step("c", 2), step("d", 3)],
            dependencies: vec![
                StepDependency { step_id: "b".to_string(), depends_on: vec!["a".to_string()], dependency_type: DependencyType::Sequential },
                StepDependency { step_id: "c".to_string(), depends_on: vec!["a".to_string()], dependency_type: DependencyType::Sequential },
                StepDependency { step_id: "d".to_string(), depends_on: vec!["b".to_string(), "c".to_string()], dependency_type: DependencyType::Sequential },
            ],
            parallel_groups: vec![],
            checkpoints: vec![],
        };
        let result = waves(&plan).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], vec!["a".to_string()]);
        let mut wave1 = result[1].clone();
        wave1.sort();
        assert_eq!(wave1, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(result[2], vec!["d".to_string()]);
    }

    #[test]
    fn waves_detects_cycles() {
        let plan = ExecutionPlan {
            steps: vec![step("a", 0), step("b", 1)],
            dependencies: vec![
                StepDependency { step_id: "a".to_string(), depends_on: vec!["b".to_string()], dependency_type: DependencyType::Sequential },
                StepDependency { step_id: "b".to_string(), depends_on: vec!["a".to_string()], dependency_type: DependencyType::Sequential },
            ],
            parallel_groups: vec![],
            checkpoints: vec![],
        };
        assert!(waves(&plan).is_err());
    }

    #[test]
    fn waves_of_empty_plan_is_empty() {
        let plan = ExecutionPlan::default();
        assert!(waves(&plan).unwrap().is_empty());
    }
}
