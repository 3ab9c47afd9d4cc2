//! Core data model of the orchestration engine.
//!
//! # Domain Model
//! - [`State`] / [`StateType`]: lifecycle stage plus append-only transition
//!   history, shared by executions and task runs
//! - [`TaskRun`]: one instantiation of a task node within one execution
//! - [`Execution`]: the mutable-by-replacement aggregate of one flow run
//! - [`Flow`] / [`Task`]: the declarative definitions
//! - [`Trigger`] / [`TriggerContext`] / [`TriggerConfig`]: the scheduler's
//!   bookmark, its evaluation context, and the trigger configurations
//!
//! # Error Handling
//! - [`CoreError`]: core error type with proper error chains
//! - [`Result<T>`]: type alias for results using `CoreError`

mod error;
mod execution;
mod flow;
mod renderer;
mod state;
mod task;
mod task_run;
mod trigger;

pub use error::{CoreError, Result};
pub use execution::{Execution, ExecutionTrigger};
pub use flow::Flow;
pub use renderer::{JsonRenderer, Renderer};
pub use state::{State, StateHistory, StateType};
pub use task::{NextTaskRun, ResolvedTask, Task, TaskKind};
pub use task_run::TaskRun;
pub use trigger::{
    Backfill, FlowTrigger, Schedule, ScheduleCondition, Trigger, TriggerCondition, TriggerConfig,
    TriggerContext, Webhook,
};
