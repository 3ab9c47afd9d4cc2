//! Execution engine: the next-task resolver, the executor event loop, and
//! the worker that runs leaf tasks and evaluates polling triggers.
//!
//! Module organization:
//! - [`flowable`]: pure resolution functions (no I/O)
//! - [`executor`]: the authoritative loop advancing executions
//! - [`worker`]: out-of-process work, behind queues

use serde_json::{Map, Value};
use thiserror::Error;

mod executor;
mod flowable;
mod worker;

pub use executor::Executor;
pub use flowable::{
    current_task_list, resolve, resolve_each_tasks, resolve_flowable_state,
    resolve_parallel_nexts, resolve_sequential_nexts, Resolution,
};
pub use worker::{Registry, TaskHandler, TaskOutcome, Worker};

use crate::core::{CoreError, Execution, Flow, Task, TaskRun, TriggerConfig, TriggerContext};
use crate::queue::QueueError;
use crate::storage::StorageError;

/// Execution layer error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// A core model operation failed.
    #[error("core error")]
    Core(#[from] CoreError),

    /// A queue operation failed.
    #[error("queue error")]
    Queue(#[from] QueueError),

    /// A storage operation failed.
    #[error("storage error")]
    Storage(#[from] StorageError),

    /// The flow for an execution is not in the catalog.
    #[error("flow not found for execution: {namespace}_{flow_id}_{revision}")]
    FlowNotFound {
        namespace: String,
        flow_id: String,
        revision: u32,
    },
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Dispatch envelope for out-of-process work, sent to workers.
#[derive(Debug, Clone)]
pub enum WorkerJob {
    Task(WorkerTask),
    Trigger(WorkerTrigger),
}

/// A leaf task to execute.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub task_run: TaskRun,
    pub task: Task,
}

/// A task run state change reported back to the executor. Flowable task runs
/// also travel through this envelope when the executor itself promotes or
/// folds them.
#[derive(Debug, Clone)]
pub struct WorkerTaskResult {
    pub task_run: TaskRun,
}

/// A polling trigger to evaluate.
#[derive(Debug, Clone)]
pub struct WorkerTrigger {
    pub flow: Flow,
    pub trigger: TriggerConfig,
    pub context: TriggerContext,
}

/// Result of a polling trigger evaluation.
#[derive(Debug, Clone)]
pub struct WorkerTriggerResult {
    pub context: TriggerContext,
    pub success: bool,
    pub execution: Option<Execution>,
}

/// Template variables exposed when resolving an execution's dynamic tasks.
pub(crate) fn execution_vars(execution: &Execution) -> Value {
    let mut outputs = Map::new();
    for task_run in &execution.task_run_list {
        if let Some(value) = &task_run.outputs {
            outputs.insert(task_run.task_id.clone(), value.clone());
        }
    }

    let mut vars = Map::new();
    if let Some(inputs) = &execution.inputs {
        vars.insert("inputs".to_string(), inputs.clone());
    }
    vars.insert("outputs".to_string(), Value::Object(outputs));
    if let Some(trigger) = &execution.trigger {
        vars.insert("trigger".to_string(), trigger.variables.clone());
    }

    Value::Object(vars)
}
