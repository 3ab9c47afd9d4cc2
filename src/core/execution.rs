use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::error::{CoreError, Result};
use super::flow::Flow;
use super::state::{State, StateType};
use super::task::ResolvedTask;
use super::task_run::TaskRun;

/// Provenance of an execution created by a trigger firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrigger {
    /// Id of the trigger on the flow definition.
    pub id: String,
    /// Variables produced by the trigger evaluation (dates, upstream
    /// execution info, ...), exposed to the execution.
    pub variables: Value,
}

/// The mutable-by-replacement aggregate of one flow run: flow identity, the
/// ordered task run list, the overall state, inputs and trigger provenance.
///
/// Every change produces a new value through the with-ers; the executor is
/// the sole writer of authoritative state, and stale copies held elsewhere
/// are reconciled by merging task-run updates keyed by `(task_id, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    pub task_run_list: Vec<TaskRun>,
    pub state: State,
    pub inputs: Option<Value>,
    pub trigger: Option<ExecutionTrigger>,
}

impl Execution {
    /// A fresh `CREATED` execution for a flow.
    pub fn new(flow: &Flow, inputs: Option<Value>) -> Self {
        Execution {
            id: Uuid::new_v4(),
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            flow_revision: flow.revision,
            task_run_list: Vec::new(),
            state: State::new(),
            inputs,
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: ExecutionTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_state(&self, state: StateType) -> Execution {
        Execution {
            state: self.state.with_state(state),
            ..self.clone()
        }
    }

    /// Replace an existing task run (matched by id) with an updated value.
    pub fn with_task_run(&self, task_run: TaskRun) -> Result<Execution> {
        let mut task_run_list = self.task_run_list.clone();

        let position = task_run_list
            .iter()
            .position(|t| t.id == task_run.id)
            .ok_or(CoreError::TaskRunNotFound {
                task_run_id: task_run.id,
                execution_id: self.id,
            })?;

        task_run_list[position] = task_run;

        Ok(Execution {
            task_run_list,
            ..self.clone()
        })
    }

    /// Append freshly created task runs.
    pub fn with_task_runs(&self, task_runs: Vec<TaskRun>) -> Execution {
        let mut task_run_list = self.task_run_list.clone();
        task_run_list.extend(task_runs);

        Execution {
            task_run_list,
            ..self.clone()
        }
    }

    pub fn find_task_run_by_id(&self, id: Uuid) -> Option<&TaskRun> {
        self.task_run_list.iter().find(|t| t.id == id)
    }

    /// All task runs belonging to the given resolved task list, honoring the
    /// `(task_id, value)` identity and the parent linkage.
    pub fn find_task_runs<'a>(
        &'a self,
        resolved_tasks: &[ResolvedTask],
        parent: Option<&TaskRun>,
    ) -> Vec<&'a TaskRun> {
        self.task_run_list
            .iter()
            .filter(|task_run| {
                resolved_tasks
                    .iter()
                    .any(|resolved| resolved.matches(task_run, parent))
            })
            .collect()
    }

    /// Select the task list the execution must follow at this level: the
    /// error branch once a sibling has failed (or error-branch runs already
    /// exist), the normal list otherwise. Disabled tasks are filtered out.
    pub fn find_task_depending_flow_state(
        &self,
        resolved_tasks: &[ResolvedTask],
        resolved_errors: &[ResolvedTask],
        parent: Option<&TaskRun>,
    ) -> Vec<ResolvedTask> {
        let tasks = Self::remove_disabled(resolved_tasks);
        let errors = Self::remove_disabled(resolved_errors);

        let error_runs = self.find_task_runs(&errors, parent);

        if !error_runs.is_empty() || self.has_failed(&tasks, parent) {
            return errors;
        }

        tasks
    }

    fn remove_disabled(resolved: &[ResolvedTask]) -> Vec<ResolvedTask> {
        resolved
            .iter()
            .filter(|r| !r.task.disabled)
            .cloned()
            .collect()
    }

    pub fn has_failed(&self, resolved_tasks: &[ResolvedTask], parent: Option<&TaskRun>) -> bool {
        self.find_task_runs(resolved_tasks, parent)
            .iter()
            .any(|t| t.state.is_failed())
    }

    pub fn has_created(&self, resolved_tasks: &[ResolvedTask], parent: Option<&TaskRun>) -> bool {
        self.find_task_runs(resolved_tasks, parent)
            .iter()
            .any(|t| t.state.is_created())
    }

    pub fn has_running(&self, resolved_tasks: &[ResolvedTask], parent: Option<&TaskRun>) -> bool {
        self.find_task_runs(resolved_tasks, parent)
            .iter()
            .any(|t| t.state.is_running())
    }

    /// All resolved tasks of the list have a terminated run. For dynamically
    /// expanded tasks the list already contains one entry per distinct value,
    /// so the count covers every expansion.
    pub fn is_terminated(&self, resolved_tasks: &[ResolvedTask], parent: Option<&TaskRun>) -> bool {
        let terminated = self
            .find_task_runs(resolved_tasks, parent)
            .iter()
            .filter(|t| t.state.is_terminated())
            .count();

        terminated == resolved_tasks.len()
    }

    pub fn find_last_created<'a>(task_runs: &[&'a TaskRun]) -> Option<&'a TaskRun> {
        task_runs.iter().rev().find(|t| t.state.is_created()).copied()
    }

    pub fn find_last_running<'a>(task_runs: &[&'a TaskRun]) -> Option<&'a TaskRun> {
        task_runs.iter().rev().find(|t| t.state.is_running()).copied()
    }

    pub fn find_last_terminated<'a>(task_runs: &[&'a TaskRun]) -> Option<&'a TaskRun> {
        task_runs
            .iter()
            .rev()
            .find(|t| t.state.is_terminated())
            .copied()
    }

    fn find_last_by_state<'a>(task_runs: &[&'a TaskRun], state: StateType) -> Option<&'a TaskRun> {
        task_runs
            .iter()
            .rev()
            .find(|t| t.state.current() == state)
            .copied()
    }

    /// The terminal state the given task list resolves to once concluded:
    /// KILLED wins over FAILED, FAILED over WARNING, otherwise SUCCESS.
    pub fn guess_final_state(
        &self,
        resolved_tasks: &[ResolvedTask],
        parent: Option<&TaskRun>,
    ) -> StateType {
        let task_runs = self.find_task_runs(resolved_tasks, parent);

        Self::find_last_by_state(&task_runs, StateType::Killed)
            .or_else(|| Self::find_last_by_state(&task_runs, StateType::Failed))
            .or_else(|| Self::find_last_by_state(&task_runs, StateType::Warning))
            .map(|t| t.state.current())
            .unwrap_or(StateType::Success)
    }

    /// Whether an incoming task run update may be merged into this execution.
    ///
    /// Rejects replays: unknown runs are joinable, same-state updates are
    /// not, regressions from a terminated run are not, and updates carrying
    /// a shorter history than the recorded one are stale.
    pub fn has_task_run_joinable(&self, task_run: &TaskRun) -> bool {
        let current = self
            .task_run_list
            .iter()
            .find(|t| t.is_same(task_run));

        let Some(current) = current else {
            return true;
        };

        if current.state.current() == task_run.state.current() {
            return false;
        }

        if current.state.is_terminated() && !task_run.state.is_terminated() {
            return false;
        }

        if current.state.histories().len() > task_run.state.histories().len() {
            return false;
        }

        true
    }

    /// Fold an executor-side failure into the execution: the last live task
    /// run is failed when one exists, otherwise the execution itself.
    pub fn failed_execution_from_executor(&self, error: impl std::fmt::Display) -> Execution {
        warn!(
            namespace = %self.namespace,
            flow = %self.flow_id,
            execution = %self.id,
            "flow failed from executor with error '{}'",
            error
        );

        let last_live = self
            .task_run_list
            .iter()
            .rev()
            .find(|t| !t.state.is_terminated());

        match last_live {
            Some(task_run) => {
                let failed = task_run.with_state(StateType::Failed);
                match self.with_task_run(failed) {
                    Ok(execution) => execution,
                    Err(_) => self.with_state(StateType::Failed),
                }
            }
            None if self.state.current() != StateType::Failed => {
                self.with_state(StateType::Failed)
            }
            None => self.clone(),
        }
    }

    /// Compact rendering for log statements.
    pub fn to_string_state(&self) -> String {
        format!(
            "Execution(id={}, state={}, taskRuns=[{}])",
            self.id,
            self.state.current(),
            self.task_run_list
                .iter()
                .map(|t| t.to_string_state())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}
