use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::execution::Execution;
use super::task_run::TaskRun;

/// A single task node of a flow definition.
///
/// Tasks form a closed set of variants: a `Leaf` is dispatched to a worker,
/// the flowable containers own child tasks and complete by aggregating their
/// children's outcomes. Every task may carry its own `errors` sub-list, the
/// branch the resolver pivots to when a child of this level fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    #[serde(flatten)]
    pub kind: TaskKind,

    /// Task-local error branch.
    #[serde(default)]
    pub errors: Vec<Task>,

    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// A unit of work executed out of process by a worker. `plugin` selects
    /// the handler on the worker's registry.
    Leaf {
        plugin: String,
        #[serde(default)]
        config: Value,
    },

    /// Children run one after the other, in list order.
    Sequential { tasks: Vec<Task> },

    /// Children run concurrently; `concurrency` 0 means unbounded.
    Parallel {
        tasks: Vec<Task>,
        #[serde(default)]
        concurrency: usize,
    },

    /// Children are expanded once per distinct value produced by rendering
    /// the `values` template, each expansion keyed by `(task_id, value)`.
    Each { tasks: Vec<Task>, values: String },
}

impl Task {
    pub fn leaf(id: impl Into<String>, plugin: impl Into<String>, config: Value) -> Self {
        Task {
            id: id.into(),
            kind: TaskKind::Leaf {
                plugin: plugin.into(),
                config,
            },
            errors: Vec::new(),
            disabled: false,
        }
    }

    pub fn sequential(id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Task {
            id: id.into(),
            kind: TaskKind::Sequential { tasks },
            errors: Vec::new(),
            disabled: false,
        }
    }

    pub fn parallel(id: impl Into<String>, tasks: Vec<Task>, concurrency: usize) -> Self {
        Task {
            id: id.into(),
            kind: TaskKind::Parallel { tasks, concurrency },
            errors: Vec::new(),
            disabled: false,
        }
    }

    pub fn each(id: impl Into<String>, tasks: Vec<Task>, values: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            kind: TaskKind::Each {
                tasks,
                values: values.into(),
            },
            errors: Vec::new(),
            disabled: false,
        }
    }

    pub fn with_errors(mut self, errors: Vec<Task>) -> Self {
        self.errors = errors;
        self
    }

    /// Whether this task owns child tasks and drives them to completion
    /// instead of being sent to a worker.
    pub fn is_flowable(&self) -> bool {
        !matches!(self.kind, TaskKind::Leaf { .. })
    }

    /// The child task list of a flowable task; empty for leaves.
    pub fn child_tasks(&self) -> &[Task] {
        match &self.kind {
            TaskKind::Leaf { .. } => &[],
            TaskKind::Sequential { tasks } => tasks,
            TaskKind::Parallel { tasks, .. } => tasks,
            TaskKind::Each { tasks, .. } => tasks,
        }
    }

    /// Recursive lookup by task id, descending into children and error
    /// branches.
    pub fn find_by_id(&self, id: &str) -> Option<&Task> {
        if self.id == id {
            return Some(self);
        }

        self.child_tasks()
            .iter()
            .chain(self.errors.iter())
            .find_map(|task| task.find_by_id(id))
    }
}

/// A task bound to the position it will run at: the parent task run that owns
/// it (if nested) and the iteration value (if expanded by an `Each`).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask {
    pub task: Task,
    pub value: Option<String>,
    pub parent_id: Option<Uuid>,
}

impl ResolvedTask {
    pub fn of(tasks: &[Task]) -> Vec<ResolvedTask> {
        tasks
            .iter()
            .map(|task| ResolvedTask {
                task: task.clone(),
                value: None,
                parent_id: None,
            })
            .collect()
    }

    /// Bind a task list to a parent task run.
    pub fn of_parent(tasks: &[Task], parent: &TaskRun) -> Vec<ResolvedTask> {
        tasks
            .iter()
            .map(|task| ResolvedTask {
                task: task.clone(),
                value: None,
                parent_id: Some(parent.id),
            })
            .collect()
    }

    /// Whether `task_run` is the run of this resolved task, honoring the
    /// `(task_id, value)` logical identity and the parent linkage.
    pub fn matches(&self, task_run: &TaskRun, parent: Option<&TaskRun>) -> bool {
        self.task.id == task_run.task_id
            && parent.map_or(true, |p| Some(p.id) == task_run.parent_task_run_id)
            && self
                .value
                .as_ref()
                .map_or(true, |value| Some(value) == task_run.value.as_ref())
    }

    pub fn to_next_task_run(&self, execution: &Execution) -> NextTaskRun {
        NextTaskRun {
            task_run: TaskRun::of(execution, self),
            task: self.task.clone(),
        }
    }
}

/// A task run the resolver proposes to create, paired with its task
/// definition so the executor can dispatch without a second lookup.
#[derive(Debug, Clone)]
pub struct NextTaskRun {
    pub task_run: TaskRun,
    pub task: Task,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flowable_capability() {
        let leaf = Task::leaf("t1", "noop", json!({}));
        assert!(!leaf.is_flowable());
        assert!(leaf.child_tasks().is_empty());

        let seq = Task::sequential("s1", vec![leaf.clone()]);
        assert!(seq.is_flowable());
        assert_eq!(seq.child_tasks().len(), 1);
    }

    #[test]
    fn test_find_by_id_descends_into_errors() {
        let task = Task::sequential(
            "root",
            vec![Task::leaf("a", "noop", json!({}))
                .with_errors(vec![Task::leaf("a-recover", "noop", json!({}))])],
        );

        assert!(task.find_by_id("a").is_some());
        assert!(task.find_by_id("a-recover").is_some());
        assert!(task.find_by_id("missing").is_none());
    }
}
