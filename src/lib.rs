//! Choreo: workflow orchestration core.
//!
//! Flows (declarative DAGs of tasks) are triggered by schedules, upstream
//! flow completions or external events; executions are created, and tasks
//! are resolved and dispatched to workers one step at a time until the flow
//! terminates. The engine survives process restarts, runs across multiple
//! nodes, guarantees that a trigger fires at most once per scheduled
//! instant, and resolves a flow's task graph deterministically from its
//! mutable execution history.
//!
//! # Features
//!
//! - **Trigger scheduling**: a serialized one-second evaluation loop with
//!   interval debounce, an at-most-one-in-flight running guard, sequential
//!   backfill and late-date handling
//! - **Deterministic task resolution**: pure functions over the execution's
//!   task-run history decide the next task runs or the terminal state
//! - **Nested containers**: sequential, parallel and dynamically expanded
//!   task groups propagate state to their parent
//! - **Error branches**: task-local and flow-level error flows, pivoted to
//!   on failure and never retriggered
//! - **Idempotent event handling**: duplicated or out-of-order queue
//!   deliveries are deduplicated by the task run's logical identity
//!
//! # Quick Start
//!
//! ```no_run
//! use choreo::core::{Flow, JsonRenderer, Task};
//! use choreo::executor::{Executor, Registry, TaskOutcome};
//! use choreo::listeners::FlowListeners;
//! use choreo::queue::{MemoryQueue, Queue};
//! use std::sync::Arc;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let flow_queue = Arc::new(MemoryQueue::new());
//! let execution_queue = Arc::new(MemoryQueue::new());
//! let worker_job_queue = Arc::new(MemoryQueue::new());
//! let worker_task_result_queue = Arc::new(MemoryQueue::new());
//!
//! let flow_listeners = FlowListeners::new();
//! flow_listeners.run(flow_queue.as_ref());
//!
//! let executor = Executor::new(
//!     flow_listeners.clone(),
//!     execution_queue.clone(),
//!     worker_job_queue.clone(),
//!     worker_task_result_queue.clone(),
//!     Arc::new(JsonRenderer),
//! );
//! executor.run();
//!
//! let mut registry = Registry::new();
//! registry.register("log", Arc::new(|_task| {
//!     Box::pin(async move { Ok(TaskOutcome::Success(None)) })
//! }));
//!
//! let flow = Flow::new(
//!     "hello",
//!     "io.choreo.quickstart",
//!     1,
//!     vec![Task::leaf("say-hello", "log", json!({"message": "hello"}))],
//! );
//! flow_queue.emit(flow.clone()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: the shared data model (state machine, executions, task runs,
//!   flows, triggers)
//! - [`queue`]: the durable queue seam between subsystems
//! - [`storage`]: trigger bookmark and execution lookup seams
//! - [`executor`]: next-task resolution, the executor loop, the worker
//! - [`scheduler`]: the polling trigger evaluation loop
//! - [`listeners`]: the flow catalog cache

pub mod core;
pub mod executor;
pub mod listeners;
pub mod queue;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types for convenience
pub use crate::core::{
    Execution, Flow, JsonRenderer, Renderer, Schedule, State, StateType, Task, TaskRun, Trigger,
    TriggerConfig, TriggerContext,
};
pub use crate::executor::{
    Executor, Registry, Resolution, TaskOutcome, Worker, WorkerJob, WorkerTask, WorkerTaskResult,
    WorkerTrigger, WorkerTriggerResult,
};
pub use crate::listeners::FlowListeners;
pub use crate::queue::{MemoryQueue, Queue};
pub use crate::scheduler::{FlowWithPollingTrigger, Scheduler};
pub use crate::storage::{
    ExecutionRepository, MemoryExecutionRepository, MemoryTriggerStore, TriggerStore,
};

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::core::{
        Execution, Flow, FlowTrigger, JsonRenderer, Renderer, Schedule, State, StateType, Task,
        TaskKind, TaskRun, Trigger, TriggerCondition, TriggerConfig, TriggerContext,
    };
    pub use crate::executor::{
        Executor, Registry, Resolution, TaskOutcome, Worker, WorkerJob, WorkerTask,
        WorkerTaskResult, WorkerTrigger, WorkerTriggerResult,
    };
    pub use crate::listeners::FlowListeners;
    pub use crate::queue::{ConsumerHandle, MemoryQueue, Queue};
    pub use crate::scheduler::{FlowWithPollingTrigger, Scheduler};
    pub use crate::storage::{
        ExecutionRepository, MemoryExecutionRepository, MemoryTriggerStore, TriggerStore,
    };
    pub use std::sync::Arc;
}
