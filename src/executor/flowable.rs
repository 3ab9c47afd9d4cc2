//! Next-task resolution: the pure decision functions of the execution state
//! machine.
//!
//! Everything here computes over an execution's accumulated task-run history
//! and a resolved task list; no I/O, no clocks beyond task-run creation
//! timestamps. The executor owns applying the decisions.

use serde_json::Value;
use tracing::warn;

use crate::core::{
    CoreError, Execution, NextTaskRun, Renderer, ResolvedTask, Result, StateType, Task, TaskRun,
};

/// Outcome of resolving an execution against its task lists.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Task runs to create and dispatch.
    Next(Vec<NextTaskRun>),
    /// Every task concluded; the execution terminates with this state.
    Terminal(StateType),
    /// Nothing to do: a run is in flight or a worker result is pending.
    Nothing,
}

/// Resolve the next step of an execution at the flow level.
pub fn resolve(execution: &Execution, tasks: &[Task], errors: &[Task]) -> Resolution {
    let resolved_tasks = ResolvedTask::of(tasks);
    let resolved_errors = ResolvedTask::of(errors);

    let nexts = resolve_sequential_nexts(execution, &resolved_tasks, &resolved_errors, None);
    if !nexts.is_empty() {
        return Resolution::Next(nexts);
    }

    let current = current_task_list(execution, &resolved_tasks, &resolved_errors, None);

    if execution.is_terminated(&current, None) {
        return Resolution::Terminal(execution.guess_final_state(&resolved_tasks, None));
    }

    Resolution::Nothing
}

/// Select the task list to follow at one nesting level.
///
/// A failed sibling pivots resolution to an error branch: the failed task's
/// own `errors` sub-list while it is still in flight, the level's error list
/// otherwise. Error branches never loop: once an error branch has fully
/// terminated the level is left to conclude, however the branch ended.
pub fn current_task_list(
    execution: &Execution,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
    parent: Option<&TaskRun>,
) -> Vec<ResolvedTask> {
    if let Some(local_errors) = task_local_errors(execution, tasks, parent) {
        return local_errors;
    }

    execution.find_task_depending_flow_state(tasks, errors, parent)
}

/// The task-local error branch of the last failed sibling, as long as that
/// branch has not fully terminated.
fn task_local_errors(
    execution: &Execution,
    tasks: &[ResolvedTask],
    parent: Option<&TaskRun>,
) -> Option<Vec<ResolvedTask>> {
    let task_runs = execution.find_task_runs(tasks, parent);
    let failed = task_runs.iter().rev().find(|t| t.state.is_failed())?;

    let resolved = tasks.iter().find(|r| r.task.id == failed.task_id)?;
    if resolved.task.errors.is_empty() {
        return None;
    }

    let resolved_errors = match parent {
        Some(parent) => ResolvedTask::of_parent(&resolved.task.errors, parent),
        None => ResolvedTask::of(&resolved.task.errors),
    };

    if execution.is_terminated(&resolved_errors, parent) {
        return None;
    }

    Some(resolved_errors)
}

/// Sequential container semantics: bootstrap the first task, wait while a
/// run is CREATED (double-dispatch guard) or RUNNING, then step to the task
/// following the last terminated one.
pub fn resolve_sequential_nexts(
    execution: &Execution,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
    parent: Option<&TaskRun>,
) -> Vec<NextTaskRun> {
    let current = current_task_list(execution, tasks, errors, parent);

    inner_resolve_sequential_nexts(execution, &current, parent)
}

fn inner_resolve_sequential_nexts(
    execution: &Execution,
    current: &[ResolvedTask],
    parent: Option<&TaskRun>,
) -> Vec<NextTaskRun> {
    // nothing
    if current.is_empty() {
        return Vec::new();
    }

    // first one
    let task_runs = execution.find_task_runs(current, parent);
    if task_runs.is_empty() {
        return vec![current[0].to_next_task_run(execution)];
    }

    // one created, leave (in-flight guard against double dispatch)
    if Execution::find_last_created(&task_runs).is_some() {
        return Vec::new();
    }

    // one running, leave
    if Execution::find_last_running(&task_runs).is_some() {
        return Vec::new();
    }

    // last terminated, find the next one
    if let Some(last_terminated) = Execution::find_last_terminated(&task_runs) {
        let last_index = task_runs
            .iter()
            .position(|t| t.id == last_terminated.id)
            .unwrap_or(0);

        if current.len() > last_index + 1 {
            return vec![current[last_index + 1].to_next_task_run(execution)];
        }
    }

    Vec::new()
}

/// Parallel container semantics: every not-yet-created child is proposed at
/// once, bounded by `concurrency` (0 means unbounded), counting the
/// currently running children against the bound.
pub fn resolve_parallel_nexts(
    execution: &Execution,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
    parent: Option<&TaskRun>,
    concurrency: usize,
) -> Vec<NextTaskRun> {
    let current = current_task_list(execution, tasks, errors, parent);
    let task_runs = execution.find_task_runs(&current, parent);

    let not_created: Vec<&ResolvedTask> = current
        .iter()
        .filter(|resolved| !task_runs.iter().any(|run| resolved.matches(run, parent)))
        .collect();

    let running_count = task_runs.iter().filter(|t| t.state.is_running()).count();

    if concurrency > 0 && running_count > concurrency {
        return Vec::new();
    }

    // wait for created runs to be acknowledged before proposing more
    if not_created.is_empty() || Execution::find_last_created(&task_runs).is_some() {
        return Vec::new();
    }

    let nexts = not_created
        .iter()
        .map(|resolved| resolved.to_next_task_run(execution));

    if concurrency > 0 {
        nexts.take(concurrency.saturating_sub(running_count)).collect()
    } else {
        nexts.collect()
    }
}

/// Expand a dynamic task list: one resolved child per `(task, value)` pair
/// for every distinct value produced by rendering the `values` template.
pub fn resolve_each_tasks(
    renderer: &dyn Renderer,
    parent: &TaskRun,
    tasks: &[Task],
    values: &str,
    vars: &Value,
) -> Result<Vec<ResolvedTask>> {
    let rendered = renderer.render(values, vars)?;

    let items = match rendered {
        Value::Array(items) => items,
        other => {
            return Err(CoreError::InvalidExpansion(format!(
                "expected an array of values, got '{}'",
                other
            )))
        }
    };

    let mut distinct: Vec<String> = Vec::new();
    for item in &items {
        if item.is_null() {
            return Err(CoreError::InvalidExpansion(format!(
                "found null value in expansion, values={:?}",
                items
            )));
        }

        let value = match item {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        if !distinct.contains(&value) {
            distinct.push(value);
        }
    }

    let mut resolved = Vec::with_capacity(distinct.len() * tasks.len());
    for value in &distinct {
        for task in tasks {
            resolved.push(ResolvedTask {
                task: task.clone(),
                value: Some(value.clone()),
                parent_id: Some(parent.id),
            });
        }
    }

    Ok(resolved)
}

/// The terminal state a flowable parent folds to once its current task list
/// concludes; `None` while children are still in flight.
///
/// The parent fails iff any descendant failed: child flowables fold their own
/// failures first, so the direct children carry the verdict.
pub fn resolve_flowable_state(
    execution: &Execution,
    tasks: &[ResolvedTask],
    errors: &[ResolvedTask],
    parent: &TaskRun,
) -> Option<StateType> {
    let current = current_task_list(execution, tasks, errors, Some(parent));

    if current.is_empty() {
        if tasks.is_empty() {
            warn!(
                execution = %execution.id,
                task = %parent.task_id,
                "no child task found for flowable task"
            );
            return Some(StateType::Failed);
        }

        // the error branch is empty: a failure concludes the parent now
        if execution.has_failed(tasks, Some(parent)) {
            return Some(execution.guess_final_state(tasks, Some(parent)));
        }

        return None;
    }

    if execution.is_terminated(&current, Some(parent)) {
        return Some(execution.guess_final_state(tasks, Some(parent)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Flow, JsonRenderer};
    use serde_json::json;

    fn leaf(id: &str) -> Task {
        Task::leaf(id, "noop", json!({}))
    }

    fn flow_abc() -> Flow {
        Flow::new(
            "sequential",
            "io.choreo.tests",
            1,
            vec![leaf("a"), leaf("b"), leaf("c")],
        )
    }

    fn apply_next(execution: &Execution, nexts: &[NextTaskRun]) -> Execution {
        execution.with_task_runs(nexts.iter().map(|n| n.task_run.clone()).collect())
    }

    fn conclude(execution: &Execution, task_id: &str, state: StateType) -> Execution {
        let run = execution
            .task_run_list
            .iter()
            .find(|t| t.task_id == task_id)
            .unwrap()
            .with_state(StateType::Running)
            .with_state(state);
        execution.with_task_run(run).unwrap()
    }

    #[test]
    fn test_sequential_resolution_order() {
        let flow = flow_abc();
        let mut execution = Execution::new(&flow, None);

        // bootstrap proposes the first task only
        let Resolution::Next(nexts) = resolve(&execution, &flow.tasks, &flow.errors) else {
            panic!("expected nexts");
        };
        assert_eq!(nexts.len(), 1);
        assert_eq!(nexts[0].task_run.task_id, "a");
        execution = apply_next(&execution, &nexts);

        // created run blocks further resolution
        assert!(matches!(
            resolve(&execution, &flow.tasks, &flow.errors),
            Resolution::Nothing
        ));

        execution = conclude(&execution, "a", StateType::Success);
        let Resolution::Next(nexts) = resolve(&execution, &flow.tasks, &flow.errors) else {
            panic!("expected nexts");
        };
        assert_eq!(nexts[0].task_run.task_id, "b");
        execution = apply_next(&execution, &nexts);

        execution = conclude(&execution, "b", StateType::Success);
        let Resolution::Next(nexts) = resolve(&execution, &flow.tasks, &flow.errors) else {
            panic!("expected nexts");
        };
        assert_eq!(nexts[0].task_run.task_id, "c");
        execution = apply_next(&execution, &nexts);

        execution = conclude(&execution, "c", StateType::Success);
        assert!(matches!(
            resolve(&execution, &flow.tasks, &flow.errors),
            Resolution::Terminal(StateType::Success)
        ));
    }

    #[test]
    fn test_failure_without_errors_terminates_failed() {
        let flow = flow_abc();
        let mut execution = Execution::new(&flow, None);

        let Resolution::Next(nexts) = resolve(&execution, &flow.tasks, &flow.errors) else {
            panic!("expected nexts");
        };
        execution = apply_next(&execution, &nexts);
        execution = conclude(&execution, "a", StateType::Failed);

        assert!(matches!(
            resolve(&execution, &flow.tasks, &flow.errors),
            Resolution::Terminal(StateType::Failed)
        ));
    }

    #[test]
    fn test_task_local_error_branch_pivot() {
        // a declares its own error branch: on failure e1 runs, b never does
        let tasks = vec![leaf("a").with_errors(vec![leaf("e1")]), leaf("b")];
        let flow = Flow::new("pivot", "io.choreo.tests", 1, tasks);
        let mut execution = Execution::new(&flow, None);

        let Resolution::Next(nexts) = resolve(&execution, &flow.tasks, &flow.errors) else {
            panic!("expected nexts");
        };
        execution = apply_next(&execution, &nexts);
        execution = conclude(&execution, "a", StateType::Failed);

        let Resolution::Next(nexts) = resolve(&execution, &flow.tasks, &flow.errors) else {
            panic!("expected e1");
        };
        assert_eq!(nexts[0].task_run.task_id, "e1");
        execution = apply_next(&execution, &nexts);

        // error branch conclusion does not loop and does not resume b
        execution = conclude(&execution, "e1", StateType::Success);
        assert!(matches!(
            resolve(&execution, &flow.tasks, &flow.errors),
            Resolution::Terminal(StateType::Failed)
        ));
    }

    #[test]
    fn test_flow_level_error_branch_pivot() {
        let flow = Flow::new("errors", "io.choreo.tests", 1, vec![leaf("a"), leaf("b")])
            .with_errors(vec![leaf("on-error")]);
        let mut execution = Execution::new(&flow, None);

        let Resolution::Next(nexts) = resolve(&execution, &flow.tasks, &flow.errors) else {
            panic!("expected nexts");
        };
        execution = apply_next(&execution, &nexts);
        execution = conclude(&execution, "a", StateType::Failed);

        let Resolution::Next(nexts) = resolve(&execution, &flow.tasks, &flow.errors) else {
            panic!("expected error branch");
        };
        assert_eq!(nexts[0].task_run.task_id, "on-error");
        execution = apply_next(&execution, &nexts);

        // a failed error branch is terminal, it does not retrigger
        execution = conclude(&execution, "on-error", StateType::Failed);
        assert!(matches!(
            resolve(&execution, &flow.tasks, &flow.errors),
            Resolution::Terminal(StateType::Failed)
        ));
    }

    #[test]
    fn test_parallel_proposes_all_children() {
        let flow = Flow::new("par", "io.choreo.tests", 1, vec![]);
        let execution = Execution::new(&flow, None);
        let tasks = ResolvedTask::of(&[leaf("p1"), leaf("p2"), leaf("p3")]);

        let nexts = resolve_parallel_nexts(&execution, &tasks, &[], None, 0);
        assert_eq!(nexts.len(), 3);
    }

    #[test]
    fn test_parallel_respects_concurrency() {
        let flow = Flow::new("par", "io.choreo.tests", 1, vec![]);
        let execution = Execution::new(&flow, None);
        let tasks = ResolvedTask::of(&[leaf("p1"), leaf("p2"), leaf("p3")]);

        let nexts = resolve_parallel_nexts(&execution, &tasks, &[], None, 2);
        assert_eq!(nexts.len(), 2);
    }

    #[test]
    fn test_parallel_waits_for_created_ack() {
        let flow = Flow::new("par", "io.choreo.tests", 1, vec![]);
        let mut execution = Execution::new(&flow, None);
        let tasks = ResolvedTask::of(&[leaf("p1"), leaf("p2")]);

        let nexts = resolve_parallel_nexts(&execution, &tasks, &[], None, 1);
        assert_eq!(nexts.len(), 1);
        execution = execution.with_task_runs(vec![nexts[0].task_run.clone()]);

        // the created run has not been acknowledged: no further dispatch
        let nexts = resolve_parallel_nexts(&execution, &tasks, &[], None, 1);
        assert!(nexts.is_empty());
    }

    #[test]
    fn test_each_expansion_distinct_values() {
        let flow = Flow::new("each", "io.choreo.tests", 1, vec![leaf("root")]);
        let execution = Execution::new(&flow, None);
        let parent = TaskRun::of(&execution, &ResolvedTask::of(&[leaf("root")])[0]);

        let resolved = resolve_each_tasks(
            &JsonRenderer,
            &parent,
            &[leaf("worker")],
            r#"["x", "y", "x"]"#,
            &json!({}),
        )
        .unwrap();

        // duplicates collapse, each distinct value keyed by (task_id, value)
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].value.as_deref(), Some("x"));
        assert_eq!(resolved[1].value.as_deref(), Some("y"));
        assert!(resolved.iter().all(|r| r.parent_id == Some(parent.id)));
    }

    #[test]
    fn test_each_expansion_rejects_nulls() {
        let flow = Flow::new("each", "io.choreo.tests", 1, vec![leaf("root")]);
        let execution = Execution::new(&flow, None);
        let parent = TaskRun::of(&execution, &ResolvedTask::of(&[leaf("root")])[0]);

        let result = resolve_each_tasks(
            &JsonRenderer,
            &parent,
            &[leaf("worker")],
            r#"["x", null]"#,
            &json!({}),
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_flowable_aggregation_fails_on_any_child_failure() {
        let children = vec![leaf("c1"), leaf("c2")];
        let container = Task::parallel("container", children.clone(), 0);
        let flow = Flow::new("agg", "io.choreo.tests", 1, vec![container.clone()]);
        let mut execution = Execution::new(&flow, None);

        let parent = TaskRun::of(&execution, &ResolvedTask::of(&[container])[0])
            .with_state(StateType::Running);
        execution = execution.with_task_runs(vec![parent.clone()]);

        let resolved_children = ResolvedTask::of_parent(&children, &parent);
        let nexts = resolve_parallel_nexts(&execution, &resolved_children, &[], Some(&parent), 0);
        execution = apply_next(&execution, &nexts);

        // children still in flight: the parent must not fold
        assert!(
            resolve_flowable_state(&execution, &resolved_children, &[], &parent).is_none()
        );

        execution = conclude(&execution, "c1", StateType::Success);
        execution = conclude(&execution, "c2", StateType::Failed);

        assert_eq!(
            resolve_flowable_state(&execution, &resolved_children, &[], &parent),
            Some(StateType::Failed)
        );
    }
}
