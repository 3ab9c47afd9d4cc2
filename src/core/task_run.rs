use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::execution::Execution;
use super::state::{State, StateType};
use super::task::ResolvedTask;

/// One instantiation of a task node within one execution.
///
/// Owned exclusively by the execution that contains it. The physical identity
/// is `id`; the logical identity used to merge replayed or duplicated events
/// is `(task_id, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub namespace: String,
    pub flow_id: String,
    pub task_id: String,
    pub parent_task_run_id: Option<Uuid>,

    /// Iteration key for dynamically expanded tasks.
    pub value: Option<String>,

    pub outputs: Option<Value>,
    pub state: State,
}

impl TaskRun {
    /// Create the `CREATED` task run for a resolved task of an execution.
    pub fn of(execution: &Execution, resolved: &ResolvedTask) -> Self {
        TaskRun {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            namespace: execution.namespace.clone(),
            flow_id: execution.flow_id.clone(),
            task_id: resolved.task.id.clone(),
            parent_task_run_id: resolved.parent_id,
            value: resolved.value.clone(),
            outputs: None,
            state: State::new(),
        }
    }

    pub fn with_state(&self, state: StateType) -> TaskRun {
        TaskRun {
            state: self.state.with_state(state),
            ..self.clone()
        }
    }

    pub fn with_outputs(&self, outputs: Value) -> TaskRun {
        TaskRun {
            outputs: Some(outputs),
            ..self.clone()
        }
    }

    /// Same physical run, honoring the iteration value.
    pub fn is_same(&self, other: &TaskRun) -> bool {
        self.id == other.id && self.value == other.value
    }

    /// Compact rendering for log statements.
    pub fn to_string_state(&self) -> String {
        format!(
            "TaskRun(id={}, taskId={}, value={:?}, state={})",
            self.id,
            self.task_id,
            self.value,
            self.state.current()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flow::Flow;
    use crate::core::task::Task;
    use serde_json::json;

    fn execution() -> Execution {
        let flow = Flow::new(
            "test-flow",
            "io.choreo.tests",
            1,
            vec![Task::leaf("t1", "noop", json!({}))],
        );

        Execution::new(&flow, None)
    }

    #[test]
    fn test_of_creates_created_run() {
        let execution = execution();
        let resolved = ResolvedTask::of(&[Task::leaf("t1", "noop", json!({}))]);

        let task_run = TaskRun::of(&execution, &resolved[0]);

        assert_eq!(task_run.execution_id, execution.id);
        assert_eq!(task_run.task_id, "t1");
        assert_eq!(task_run.state.current(), StateType::Created);
        assert!(task_run.parent_task_run_id.is_none());
    }

    #[test]
    fn test_is_same_uses_value() {
        let execution = execution();
        let resolved = ResolvedTask::of(&[Task::leaf("t1", "noop", json!({}))]);
        let task_run = TaskRun::of(&execution, &resolved[0]);

        let other_value = TaskRun {
            value: Some("a".to_string()),
            ..task_run.clone()
        };

        assert!(task_run.is_same(&task_run.clone()));
        assert!(!task_run.is_same(&other_value));
    }
}
