use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use super::flowable::{
    current_task_list, resolve_each_tasks, resolve_flowable_state, resolve_parallel_nexts,
    resolve_sequential_nexts,
};
use super::{execution_vars, Result, WorkerJob, WorkerTask, WorkerTaskResult};
use crate::core::{
    Execution, Flow, NextTaskRun, Renderer, ResolvedTask, StateType, TaskKind, TaskRun,
    TriggerConfig,
};
use crate::listeners::FlowListeners;
use crate::queue::{Handler, Queue};

/// The authoritative loop advancing executions from CREATED to a terminal
/// state.
///
/// Consumes freshly created Execution events and WorkerTaskResult events,
/// folds them into the per-execution authoritative copy, invokes the
/// next-task resolver, and re-emits updated Executions plus WorkerTask
/// dispatches. One execution is advanced by at most one resolver invocation
/// at a time (a keyed lock serializes per execution id); different
/// executions process fully in parallel.
pub struct Executor {
    flow_listeners: Arc<FlowListeners>,
    execution_queue: Arc<dyn Queue<Execution>>,
    worker_job_queue: Arc<dyn Queue<WorkerJob>>,
    worker_task_result_queue: Arc<dyn Queue<WorkerTaskResult>>,
    renderer: Arc<dyn Renderer>,
    executions: DashMap<Uuid, Arc<Mutex<ExecutionHouse>>>,
}

/// Authoritative in-memory state for one live execution.
struct ExecutionHouse {
    execution: Execution,
    /// Dedup of dispatched worker tasks, task run id to last dispatched
    /// state.
    worker_task_dedup: HashMap<Uuid, StateType>,
    /// Dedup of accepted next task runs, keyed by
    /// `(parent_task_run_id, task_id, value)`.
    child_dedup: HashMap<String, Uuid>,
}

impl ExecutionHouse {
    fn new(execution: Execution) -> Self {
        ExecutionHouse {
            execution,
            worker_task_dedup: HashMap::new(),
            child_dedup: HashMap::new(),
        }
    }
}

/// One resolver pass over an execution, accumulating the effects to apply.
struct Pass {
    execution: Execution,
    nexts: Vec<NextTaskRun>,
    worker_tasks: Vec<WorkerTask>,
    worker_task_results: Vec<WorkerTaskResult>,
    execution_updated: bool,
}

impl Pass {
    fn new(execution: Execution) -> Self {
        Pass {
            execution,
            nexts: Vec::new(),
            worker_tasks: Vec::new(),
            worker_task_results: Vec::new(),
            execution_updated: false,
        }
    }

    fn with_execution(&mut self, execution: Execution) {
        self.execution = execution;
        self.execution_updated = true;
    }
}

impl Executor {
    pub fn new(
        flow_listeners: Arc<FlowListeners>,
        execution_queue: Arc<dyn Queue<Execution>>,
        worker_job_queue: Arc<dyn Queue<WorkerJob>>,
        worker_task_result_queue: Arc<dyn Queue<WorkerTaskResult>>,
        renderer: Arc<dyn Renderer>,
    ) -> Arc<Self> {
        Arc::new(Executor {
            flow_listeners,
            execution_queue,
            worker_job_queue,
            worker_task_result_queue,
            renderer,
            executions: DashMap::new(),
        })
    }

    /// Subscribe to the execution and worker-task-result queues.
    pub fn run(self: &Arc<Self>) {
        let executor = Arc::clone(self);
        let handler: Handler<Execution> = Arc::new(move |execution| {
            let executor = Arc::clone(&executor);
            Box::pin(async move {
                executor.on_execution(execution).await;
            })
        });
        self.execution_queue.receive("executor", handler);

        let executor = Arc::clone(self);
        let handler: Handler<WorkerTaskResult> = Arc::new(move |result| {
            let executor = Arc::clone(&executor);
            Box::pin(async move {
                executor.on_worker_task_result(result).await;
            })
        });
        self.worker_task_result_queue.receive("executor", handler);
    }

    /// Handle an externally emitted execution. Only fresh executions start
    /// processing here; updates the executor emitted itself circle back for
    /// other subscribers and are ignored.
    async fn on_execution(&self, execution: Execution) {
        if execution.state.is_terminated() {
            return;
        }

        if !(execution.task_run_list.is_empty() || execution.state.is_created()) {
            return;
        }

        let house = self.save_execution(execution);
        let mut house = house.lock().await;
        self.process_house(&mut house).await;
    }

    async fn on_worker_task_result(&self, result: WorkerTaskResult) {
        let Some(house) = self
            .executions
            .get(&result.task_run.execution_id)
            .map(|h| Arc::clone(&h))
        else {
            // the execution terminated and was purged, or this is a replay
            debug!(
                execution = %result.task_run.execution_id,
                task_run = %result.task_run.id,
                "dropping result for unknown execution"
            );
            return;
        };

        let mut house = house.lock().await;

        if !house.execution.has_task_run_joinable(&result.task_run) {
            trace!(
                execution = %result.task_run.execution_id,
                task_run = %result.task_run.id,
                "duplicate worker task result, skipped"
            );
            return;
        }

        match house.execution.with_task_run(result.task_run.clone()) {
            Ok(execution) => house.execution = execution,
            Err(e) => {
                house.execution = house.execution.failed_execution_from_executor(e);
            }
        }

        self.process_house(&mut house).await;
    }

    /// Merge an incoming execution into the authoritative copy, keyed by the
    /// `(task_id, value)` logical identity of each task run.
    fn save_execution(&self, execution: Execution) -> Arc<Mutex<ExecutionHouse>> {
        let entry = self
            .executions
            .entry(execution.id)
            .or_insert_with(|| Arc::new(Mutex::new(ExecutionHouse::new(execution))));

        Arc::clone(&entry)
    }

    /// Run resolver passes until the execution stops changing, applying the
    /// effects of each pass (dedup, dispatch, re-emission) as it completes.
    async fn process_house(&self, house: &mut ExecutionHouse) {
        let Some(flow) = self.flow_listeners.find_by_execution(&house.execution) else {
            error!(
                execution = %house.execution.id,
                namespace = %house.execution.namespace,
                flow = %house.execution.flow_id,
                "flow not found in the catalog"
            );
            house.execution = house
                .execution
                .failed_execution_from_executor("flow not found in the catalog");
            let _ = self.execution_queue.emit(house.execution.clone()).await;
            if house.execution.state.is_terminated() {
                self.executions.remove(&house.execution.id);
            }
            return;
        };

        loop {
            let mut pass = match self.process_pass(&flow, house.execution.clone()) {
                Ok(pass) => pass,
                Err(e) => {
                    // resolution failures never stop the executor: force the
                    // execution to FAILED and keep serving other executions
                    let mut pass = Pass::new(house.execution.failed_execution_from_executor(e));
                    pass.execution_updated = true;
                    pass
                }
            };

            // accept proposed task runs not yet dispatched, then promote a
            // created execution to running
            let accepted = self.deduplicate_nexts(house, &pass.nexts);
            if !accepted.is_empty() {
                let execution = Self::on_nexts(&flow, &pass.execution, &accepted);
                pass.with_execution(execution);
            }

            let updated = pass.execution_updated;
            house.execution = pass.execution.clone();

            if updated {
                let _ = self.execution_queue.emit(house.execution.clone()).await;
            }

            self.dispatch_worker_tasks(house, &pass.worker_tasks).await;

            for result in &pass.worker_task_results {
                let _ = self.worker_task_result_queue.emit(result.clone()).await;
            }

            if !updated {
                break;
            }
        }

        if house.execution.state.is_terminated() {
            self.on_terminated(&house.execution).await;
            self.executions.remove(&house.execution.id);
        }
    }

    /// One pass of the resolution pipeline, mirroring the order end →
    /// flow-level nexts → child nexts → child folds → worker dispatch.
    fn process_pass(&self, flow: &Flow, execution: Execution) -> Result<Pass> {
        let mut pass = Pass::new(execution);

        self.handle_end(flow, &mut pass);
        self.handle_next(flow, &mut pass);
        self.handle_child_next(flow, &mut pass)?;
        self.handle_child_worker_task_result(flow, &mut pass)?;
        self.handle_worker_task(flow, &mut pass)?;

        Ok(pass)
    }

    /// Resolve the terminal state once every current-list task concluded.
    /// Idempotent: a terminated execution is left untouched.
    fn handle_end(&self, flow: &Flow, pass: &mut Pass) {
        if pass.execution.state.is_terminated() {
            return;
        }

        let resolved_tasks = ResolvedTask::of(&flow.tasks);
        let resolved_errors = ResolvedTask::of(&flow.errors);
        let current = current_task_list(&pass.execution, &resolved_tasks, &resolved_errors, None);

        if !pass.execution.is_terminated(&current, None) {
            return;
        }

        let final_state = pass.execution.guess_final_state(&resolved_tasks, None);
        let execution = pass.execution.with_state(final_state);

        info!(
            namespace = %execution.namespace,
            flow = %execution.flow_id,
            execution = %execution.id,
            "flow completed with state {} in {:?}",
            execution.state.current(),
            execution.state.duration()
        );

        pass.with_execution(execution);
    }

    /// Flow-level sequential resolution.
    fn handle_next(&self, flow: &Flow, pass: &mut Pass) {
        if pass.execution.state.is_terminated() {
            return;
        }

        let nexts = resolve_sequential_nexts(
            &pass.execution,
            &ResolvedTask::of(&flow.tasks),
            &ResolvedTask::of(&flow.errors),
            None,
        );

        pass.nexts.extend(nexts);
    }

    /// Recurse into every running flowable task run.
    fn handle_child_next(&self, flow: &Flow, pass: &mut Pass) -> Result<()> {
        if pass.execution.state.is_terminated() {
            return Ok(());
        }

        let running: Vec<TaskRun> = pass
            .execution
            .task_run_list
            .iter()
            .filter(|t| t.state.is_running())
            .cloned()
            .collect();

        for parent in running {
            let nexts = self.child_nexts(flow, &pass.execution, &parent)?;
            pass.nexts.extend(nexts);
        }

        Ok(())
    }

    fn child_tasks_resolved(
        &self,
        execution: &Execution,
        parent: &TaskRun,
        kind: &TaskKind,
    ) -> Result<Vec<ResolvedTask>> {
        match kind {
            TaskKind::Each { tasks, values } => Ok(resolve_each_tasks(
                self.renderer.as_ref(),
                parent,
                tasks,
                values,
                &execution_vars(execution),
            )?),
            TaskKind::Sequential { tasks } => Ok(ResolvedTask::of_parent(tasks, parent)),
            TaskKind::Parallel { tasks, .. } => Ok(ResolvedTask::of_parent(tasks, parent)),
            TaskKind::Leaf { .. } => Ok(Vec::new()),
        }
    }

    fn child_nexts(
        &self,
        flow: &Flow,
        execution: &Execution,
        parent: &TaskRun,
    ) -> Result<Vec<NextTaskRun>> {
        let task = flow.find_task_by_id(&parent.task_id)?;
        if !task.is_flowable() {
            return Ok(Vec::new());
        }

        let children = self.child_tasks_resolved(execution, parent, &task.kind)?;
        let errors = ResolvedTask::of_parent(&task.errors, parent);

        Ok(match &task.kind {
            TaskKind::Sequential { .. } => {
                resolve_sequential_nexts(execution, &children, &errors, Some(parent))
            }
            TaskKind::Parallel { concurrency, .. } => {
                resolve_parallel_nexts(execution, &children, &errors, Some(parent), *concurrency)
            }
            TaskKind::Each { .. } => {
                resolve_parallel_nexts(execution, &children, &errors, Some(parent), 0)
            }
            TaskKind::Leaf { .. } => Vec::new(),
        })
    }

    /// Fold running flowable parents whose children concluded: the resulting
    /// state change is re-submitted to the loop as a worker task result, not
    /// dispatched to a worker.
    fn handle_child_worker_task_result(&self, flow: &Flow, pass: &mut Pass) -> Result<()> {
        let running: Vec<TaskRun> = pass
            .execution
            .task_run_list
            .iter()
            .filter(|t| t.state.is_running())
            .cloned()
            .collect();

        for parent in running {
            let task = flow.find_task_by_id(&parent.task_id)?;
            if !task.is_flowable() {
                continue;
            }

            let children = self.child_tasks_resolved(&pass.execution, &parent, &task.kind)?;
            let errors = ResolvedTask::of_parent(&task.errors, &parent);

            if let Some(state) =
                resolve_flowable_state(&pass.execution, &children, &errors, &parent)
            {
                pass.worker_task_results.push(WorkerTaskResult {
                    task_run: parent.with_state(state),
                });
            }
        }

        Ok(())
    }

    /// Collect every CREATED task run for dispatch.
    fn handle_worker_task(&self, flow: &Flow, pass: &mut Pass) -> Result<()> {
        for task_run in &pass.execution.task_run_list {
            if !task_run.state.is_created() {
                continue;
            }

            let task = flow.find_task_by_id(&task_run.task_id)?;
            pass.worker_tasks.push(WorkerTask {
                task_run: task_run.clone(),
                task: task.clone(),
            });
        }

        Ok(())
    }

    /// Append accepted next task runs; a created execution starts running.
    fn on_nexts(flow: &Flow, execution: &Execution, nexts: &[NextTaskRun]) -> Execution {
        trace!(
            execution = %execution.id,
            "found {} next(s)",
            nexts.len()
        );

        let execution =
            execution.with_task_runs(nexts.iter().map(|n| n.task_run.clone()).collect());

        if execution.state.current() == StateType::Created {
            info!(
                namespace = %flow.namespace,
                flow = %flow.id,
                execution = %execution.id,
                "flow started"
            );
            execution.with_state(StateType::Running)
        } else {
            execution
        }
    }

    /// Drop proposed task runs already accepted once, preventing re-dispatch
    /// storms on duplicate or out-of-order delivery.
    fn deduplicate_nexts(
        &self,
        house: &mut ExecutionHouse,
        nexts: &[NextTaskRun],
    ) -> Vec<NextTaskRun> {
        nexts
            .iter()
            .filter(|next| {
                let key = format!(
                    "{:?}-{}-{:?}",
                    next.task_run.parent_task_run_id, next.task_run.task_id, next.task_run.value
                );

                match house.child_dedup.get(&key) {
                    Some(_) => {
                        trace!(
                            execution = %next.task_run.execution_id,
                            key = %key,
                            "duplicate next task run, skipped"
                        );
                        false
                    }
                    None => {
                        house.child_dedup.insert(key, next.task_run.id);
                        true
                    }
                }
            })
            .cloned()
            .collect()
    }

    /// Dispatch accepted worker tasks: leaf tasks go to the worker, flowable
    /// tasks "run" by existing and come straight back as RUNNING results.
    async fn dispatch_worker_tasks(&self, house: &mut ExecutionHouse, worker_tasks: &[WorkerTask]) {
        for worker_task in worker_tasks {
            let state = worker_task.task_run.state.current();
            if house.worker_task_dedup.get(&worker_task.task_run.id) == Some(&state) {
                trace!(
                    execution = %worker_task.task_run.execution_id,
                    task_run = %worker_task.task_run.id,
                    "duplicate worker task, skipped"
                );
                continue;
            }
            house
                .worker_task_dedup
                .insert(worker_task.task_run.id, state);

            if worker_task.task.is_flowable() {
                let result = WorkerTaskResult {
                    task_run: worker_task.task_run.with_state(StateType::Running),
                };
                let _ = self.worker_task_result_queue.emit(result).await;
            } else {
                let _ = self
                    .worker_job_queue
                    .emit(WorkerJob::Task(worker_task.clone()))
                    .await;
            }
        }
    }

    /// Evaluate Flow triggers across all known flows once an execution fully
    /// terminates, emitting the chained executions.
    async fn on_terminated(&self, execution: &Execution) {
        for flow in self.flow_listeners.flows() {
            if flow.disabled || flow.deleted {
                continue;
            }

            for trigger in &flow.triggers {
                let TriggerConfig::Flow(flow_trigger) = trigger else {
                    continue;
                };

                if let Some(chained) =
                    flow_trigger.evaluate(self.renderer.as_ref(), &flow, execution)
                {
                    info!(
                        namespace = %flow.namespace,
                        flow = %flow.id,
                        trigger = %flow_trigger.id,
                        upstream = %execution.id,
                        execution = %chained.id,
                        "flow triggered by upstream execution"
                    );
                    let _ = self.execution_queue.emit(chained).await;
                }
            }
        }
    }
}
