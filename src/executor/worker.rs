use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{WorkerJob, WorkerTask, WorkerTaskResult, WorkerTriggerResult};
use crate::core::StateType;
use crate::queue::{Handler, Queue};

/// A boxed error that can be sent across threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a leaf task handler.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(Option<Value>),
    Warning(Option<Value>),
}

type TaskHandlerFuture = Pin<Box<dyn Future<Output = Result<TaskOutcome, BoxError>> + Send>>;

/// Handler executing one leaf task, registered per plugin name.
pub type TaskHandler = Arc<dyn Fn(WorkerTask) -> TaskHandlerFuture + Send + Sync>;

/// Maps leaf plugin names to their handlers.
///
/// The worker resolves each incoming task by its `plugin` field; tasks with
/// no registered handler fail.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, TaskHandler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: impl Into<String>, handler: TaskHandler) {
        self.handlers.insert(plugin.into(), handler);
    }

    fn get(&self, plugin: &str) -> Option<&TaskHandler> {
        self.handlers.get(plugin)
    }
}

/// Out-of-process work: executes leaf tasks and evaluates polling triggers,
/// reporting back through the result queues.
///
/// One worker handles its jobs sequentially; register several workers on the
/// same queue to scale out, the consumer group load balances between them.
pub struct Worker {
    registry: Registry,
    worker_job_queue: Arc<dyn Queue<WorkerJob>>,
    worker_task_result_queue: Arc<dyn Queue<WorkerTaskResult>>,
    worker_trigger_result_queue: Arc<dyn Queue<WorkerTriggerResult>>,
}

impl Worker {
    pub fn new(
        registry: Registry,
        worker_job_queue: Arc<dyn Queue<WorkerJob>>,
        worker_task_result_queue: Arc<dyn Queue<WorkerTaskResult>>,
        worker_trigger_result_queue: Arc<dyn Queue<WorkerTriggerResult>>,
    ) -> Arc<Self> {
        Arc::new(Worker {
            registry,
            worker_job_queue,
            worker_task_result_queue,
            worker_trigger_result_queue,
        })
    }

    pub fn run(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let handler: Handler<WorkerJob> = Arc::new(move |job| {
            let worker = Arc::clone(&worker);
            Box::pin(async move {
                match job {
                    WorkerJob::Task(task) => worker.run_task(task).await,
                    WorkerJob::Trigger(trigger) => worker.evaluate_trigger(trigger).await,
                }
            })
        });

        self.worker_job_queue.receive("worker", handler);
    }

    async fn run_task(&self, worker_task: WorkerTask) {
        let plugin = match &worker_task.task.kind {
            crate::core::TaskKind::Leaf { plugin, .. } => plugin.clone(),
            _ => {
                error!(
                    task = %worker_task.task.id,
                    "worker received a flowable task, dropping"
                );
                return;
            }
        };

        // acknowledge: the created run starts running
        let running = worker_task.task_run.with_state(StateType::Running);
        let _ = self
            .worker_task_result_queue
            .emit(WorkerTaskResult {
                task_run: running.clone(),
            })
            .await;

        let outcome = match self.registry.get(&plugin) {
            None => {
                error!(
                    task = %worker_task.task.id,
                    plugin = %plugin,
                    "no handler registered for plugin"
                );
                Err(format!("no handler registered for plugin '{}'", plugin).into())
            }
            Some(handler) => handler(worker_task.clone()).await,
        };

        let task_run = match outcome {
            Ok(TaskOutcome::Success(outputs)) => {
                let run = running.with_state(StateType::Success);
                match outputs {
                    Some(outputs) => run.with_outputs(outputs),
                    None => run,
                }
            }
            Ok(TaskOutcome::Warning(outputs)) => {
                let run = running.with_state(StateType::Warning);
                match outputs {
                    Some(outputs) => run.with_outputs(outputs),
                    None => run,
                }
            }
            Err(e) => {
                warn!(
                    task = %worker_task.task.id,
                    task_run = %worker_task.task_run.id,
                    "task failed: {}",
                    e
                );
                running.with_state(StateType::Failed)
            }
        };

        debug!(
            task = %worker_task.task.id,
            task_run = %task_run.id,
            state = %task_run.state.current(),
            "task finished"
        );

        let _ = self
            .worker_task_result_queue
            .emit(WorkerTaskResult { task_run })
            .await;
    }

    async fn evaluate_trigger(&self, worker_trigger: super::WorkerTrigger) {
        let result = match worker_trigger.trigger.evaluate_polling(&worker_trigger.context) {
            Ok(execution) => WorkerTriggerResult {
                context: worker_trigger.context,
                success: true,
                execution,
            },
            Err(e) => {
                warn!(
                    namespace = %worker_trigger.context.namespace,
                    flow = %worker_trigger.context.flow_id,
                    trigger = %worker_trigger.context.trigger_id,
                    date = %worker_trigger.context.date,
                    "trigger evaluation failed with error '{}'",
                    e
                );
                WorkerTriggerResult {
                    context: worker_trigger.context,
                    success: false,
                    execution: None,
                }
            }
        };

        let _ = self.worker_trigger_result_queue.emit(result).await;
    }
}
