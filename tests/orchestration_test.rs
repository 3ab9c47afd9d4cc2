//! End-to-end orchestration tests
//!
//! These tests wire the full engine together over in-memory queues:
//! 1. Executions advance task by task through the worker and terminate
//! 2. Failures pivot to error branches and fail the execution
//! 3. Flowable containers fold their children's outcomes
//! 4. Flow triggers chain executions across flows, exactly once
//! 5. The scheduler fires cron triggers and advances its bookmark

use choreo::prelude::*;
use choreo::queue::MemoryQueue;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Full engine wiring over in-memory queues.
struct Harness {
    flow_queue: Arc<MemoryQueue<Flow>>,
    execution_queue: Arc<MemoryQueue<Execution>>,
    worker_task_result_queue: Arc<MemoryQueue<WorkerTaskResult>>,
    trigger_store: Arc<MemoryTriggerStore>,
    repository: Arc<MemoryExecutionRepository>,
    flow_listeners: Arc<FlowListeners>,
    scheduler: Arc<Scheduler>,
    /// Every execution update observed on the execution queue.
    observed: Arc<Mutex<Vec<Execution>>>,
}

impl Harness {
    fn registry() -> Registry {
        let mut registry = Registry::new();

        registry.register(
            "ok",
            Arc::new(|worker_task: WorkerTask| {
                Box::pin(async move {
                    Ok(TaskOutcome::Success(Some(
                        json!({"task": worker_task.task.id}),
                    )))
                })
            }),
        );

        registry.register(
            "fail",
            Arc::new(|_worker_task: WorkerTask| {
                Box::pin(async move { Err("expected failure".into()) })
            }),
        );

        registry
    }

    fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();

        let flow_queue = Arc::new(MemoryQueue::new());
        let execution_queue: Arc<MemoryQueue<Execution>> = Arc::new(MemoryQueue::new());
        let worker_job_queue: Arc<MemoryQueue<WorkerJob>> = Arc::new(MemoryQueue::new());
        let worker_task_result_queue: Arc<MemoryQueue<WorkerTaskResult>> =
            Arc::new(MemoryQueue::new());
        let worker_trigger_result_queue: Arc<MemoryQueue<WorkerTriggerResult>> =
            Arc::new(MemoryQueue::new());

        let flow_listeners = FlowListeners::new();
        flow_listeners.run(flow_queue.as_ref());

        let repository = Arc::new(MemoryExecutionRepository::new());
        repository.index_from(execution_queue.as_ref());

        let executor = Executor::new(
            flow_listeners.clone(),
            execution_queue.clone(),
            worker_job_queue.clone(),
            worker_task_result_queue.clone(),
            Arc::new(JsonRenderer),
        );
        executor.run();

        let worker = Worker::new(
            Self::registry(),
            worker_job_queue.clone(),
            worker_task_result_queue.clone(),
            worker_trigger_result_queue.clone(),
        );
        worker.run();

        let trigger_store = Arc::new(MemoryTriggerStore::new());
        let scheduler = Scheduler::new(
            flow_listeners.clone(),
            trigger_store.clone(),
            repository.clone(),
            execution_queue.clone(),
            worker_job_queue.clone(),
            worker_trigger_result_queue.clone(),
        );

        let observed = Arc::new(Mutex::new(Vec::new()));
        let collected = observed.clone();
        execution_queue.receive(
            "test-observer",
            Arc::new(move |execution: Execution| {
                let collected = collected.clone();
                Box::pin(async move {
                    collected.lock().unwrap().push(execution);
                })
            }),
        );

        Harness {
            flow_queue,
            execution_queue,
            worker_task_result_queue,
            trigger_store,
            repository,
            flow_listeners,
            scheduler,
            observed,
        }
    }

    async fn register_flow(&self, flow: Flow) {
        self.flow_queue.emit(flow).await.unwrap();

        // wait for the catalog cache to pick the flow up
        for _ in 0..100 {
            if !self.flow_listeners.flows().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("flow catalog never received the flow");
    }

    async fn submit(&self, flow: &Flow) -> Uuid {
        let execution = Execution::new(flow, None);
        let id = execution.id;
        self.execution_queue.emit(execution).await.unwrap();
        id
    }

    async fn await_terminal(&self, execution_id: Uuid) -> Execution {
        for _ in 0..500 {
            {
                let observed = self.observed.lock().unwrap();
                if let Some(execution) = observed
                    .iter()
                    .rev()
                    .find(|e| e.id == execution_id && e.state.is_terminated())
                {
                    return execution.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} never terminated", execution_id);
    }

    fn terminal_count(&self, execution_id: Uuid) -> usize {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.id == execution_id && e.state.is_terminated())
            .count()
    }

    fn executions_of_flow(&self, flow_id: &str) -> Vec<Execution> {
        let mut seen = Vec::new();
        for execution in self.observed.lock().unwrap().iter() {
            if execution.flow_id == flow_id && !seen.contains(&execution.id) {
                seen.push(execution.id);
            }
        }

        seen.iter()
            .map(|id| {
                self.observed
                    .lock()
                    .unwrap()
                    .iter()
                    .rev()
                    .find(|e| &e.id == id)
                    .unwrap()
                    .clone()
            })
            .collect()
    }
}

fn history_types(task_run: &TaskRun) -> Vec<StateType> {
    task_run.state.histories().iter().map(|h| h.state).collect()
}

#[tokio::test]
async fn test_sequential_flow_succeeds() {
    let harness = Harness::start();

    let flow = Flow::new(
        "sequential-success",
        "io.choreo.tests",
        1,
        vec![
            Task::leaf("t1", "ok", json!({})),
            Task::leaf("t2", "ok", json!({})),
        ],
    );
    harness.register_flow(flow.clone()).await;

    let id = harness.submit(&flow).await;
    let execution = harness.await_terminal(id).await;

    assert_eq!(execution.state.current(), StateType::Success);
    assert_eq!(execution.task_run_list.len(), 2);
    assert_eq!(execution.task_run_list[0].task_id, "t1");
    assert_eq!(execution.task_run_list[1].task_id, "t2");
    assert_eq!(
        execution.task_run_list[0].outputs.as_ref().unwrap()["task"],
        json!("t1")
    );
}

#[tokio::test]
async fn test_failing_task_fails_the_execution() {
    let harness = Harness::start();

    let flow = Flow::new(
        "sequential-failure",
        "io.choreo.tests",
        1,
        vec![
            Task::leaf("t1", "ok", json!({})),
            Task::leaf("t2", "fail", json!({})),
        ],
    );
    harness.register_flow(flow.clone()).await;

    let id = harness.submit(&flow).await;
    let execution = harness.await_terminal(id).await;

    assert_eq!(execution.state.current(), StateType::Failed);
    assert_eq!(execution.task_run_list.len(), 2);

    assert_eq!(
        history_types(&execution.task_run_list[0]),
        vec![StateType::Created, StateType::Running, StateType::Success]
    );
    assert_eq!(
        history_types(&execution.task_run_list[1]),
        vec![StateType::Created, StateType::Running, StateType::Failed]
    );
}

#[tokio::test]
async fn test_error_branch_runs_on_failure() {
    let harness = Harness::start();

    let flow = Flow::new(
        "with-errors",
        "io.choreo.tests",
        1,
        vec![
            Task::leaf("boom", "fail", json!({})),
            Task::leaf("never", "ok", json!({})),
        ],
    )
    .with_errors(vec![Task::leaf("recover", "ok", json!({}))]);
    harness.register_flow(flow.clone()).await;

    let id = harness.submit(&flow).await;
    let execution = harness.await_terminal(id).await;

    // the error branch ran, the normal successor did not, the flow failed
    assert_eq!(execution.state.current(), StateType::Failed);
    let task_ids: Vec<&str> = execution
        .task_run_list
        .iter()
        .map(|t| t.task_id.as_str())
        .collect();
    assert_eq!(task_ids, vec!["boom", "recover"]);
    assert_eq!(
        execution.task_run_list[1].state.current(),
        StateType::Success
    );
}

#[tokio::test]
async fn test_parallel_container_folds_children() {
    let harness = Harness::start();

    let flow = Flow::new(
        "parallel",
        "io.choreo.tests",
        1,
        vec![Task::parallel(
            "container",
            vec![
                Task::leaf("c1", "ok", json!({})),
                Task::leaf("c2", "ok", json!({})),
            ],
            0,
        )],
    );
    harness.register_flow(flow.clone()).await;

    let id = harness.submit(&flow).await;
    let execution = harness.await_terminal(id).await;

    assert_eq!(execution.state.current(), StateType::Success);

    let container = execution
        .task_run_list
        .iter()
        .find(|t| t.task_id == "container")
        .unwrap();
    assert_eq!(container.state.current(), StateType::Success);

    let children: Vec<&TaskRun> = execution
        .task_run_list
        .iter()
        .filter(|t| t.parent_task_run_id == Some(container.id))
        .collect();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|t| t.state.current() == StateType::Success));
}

#[tokio::test]
async fn test_parallel_container_fails_on_any_child_failure() {
    let harness = Harness::start();

    let flow = Flow::new(
        "parallel-failure",
        "io.choreo.tests",
        1,
        vec![Task::parallel(
            "container",
            vec![
                Task::leaf("c1", "ok", json!({})),
                Task::leaf("c2", "fail", json!({})),
            ],
            0,
        )],
    );
    harness.register_flow(flow.clone()).await;

    let id = harness.submit(&flow).await;
    let execution = harness.await_terminal(id).await;

    assert_eq!(execution.state.current(), StateType::Failed);

    let container = execution
        .task_run_list
        .iter()
        .find(|t| t.task_id == "container")
        .unwrap();
    assert_eq!(container.state.current(), StateType::Failed);
}

#[tokio::test]
async fn test_each_expands_per_value() {
    let harness = Harness::start();

    let flow = Flow::new(
        "each",
        "io.choreo.tests",
        1,
        vec![Task::each(
            "fan-out",
            vec![Task::leaf("item", "ok", json!({}))],
            r#"["a", "b", "c"]"#,
        )],
    );
    harness.register_flow(flow.clone()).await;

    let id = harness.submit(&flow).await;
    let execution = harness.await_terminal(id).await;

    assert_eq!(execution.state.current(), StateType::Success);

    let mut values: Vec<String> = execution
        .task_run_list
        .iter()
        .filter(|t| t.task_id == "item")
        .map(|t| t.value.clone().unwrap())
        .collect();
    values.sort();
    assert_eq!(values, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_flow_trigger_chains_execution_exactly_once() {
    let harness = Harness::start();

    let upstream = Flow::new(
        "upstream",
        "io.choreo.tests",
        1,
        vec![Task::leaf("produce", "ok", json!({}))],
    );

    let downstream = Flow::new(
        "downstream",
        "io.choreo.tests",
        1,
        vec![Task::leaf("consume", "ok", json!({}))],
    )
    .with_triggers(vec![TriggerConfig::Flow(FlowTrigger {
        id: "listen".to_string(),
        inputs: None,
        conditions: vec![
            TriggerCondition::ExecutionFlow {
                namespace: "io.choreo.tests".to_string(),
                flow_id: "upstream".to_string(),
            },
            TriggerCondition::ExecutionStatus {
                states: vec![StateType::Success],
            },
        ],
        disabled: false,
    })]);

    harness.register_flow(upstream.clone()).await;
    harness.register_flow(downstream.clone()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = harness.submit(&upstream).await;
    harness.await_terminal(id).await;

    // the chained execution appears and completes
    for _ in 0..500 {
        let chained = harness.executions_of_flow("downstream");
        if chained.len() == 1 && chained[0].state.is_terminated() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let chained = harness.executions_of_flow("downstream");
    assert_eq!(chained.len(), 1, "downstream must be triggered exactly once");
    assert_eq!(chained[0].state.current(), StateType::Success);
    assert_eq!(chained[0].trigger.as_ref().unwrap().id, "listen");

    // replaying the upstream terminal execution must not re-trigger
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.executions_of_flow("downstream").len(), 1);
}

#[tokio::test]
async fn test_terminal_result_replay_is_idempotent() {
    let harness = Harness::start();

    let flow = Flow::new(
        "replay",
        "io.choreo.tests",
        1,
        vec![Task::leaf("t1", "ok", json!({}))],
    );
    harness.register_flow(flow.clone()).await;

    let id = harness.submit(&flow).await;
    let execution = harness.await_terminal(id).await;
    assert_eq!(execution.state.current(), StateType::Success);

    let terminal_count = harness.terminal_count(id);

    // replay the terminal worker task result: the execution was purged, the
    // duplicate must be dropped without re-firing anything
    let replayed = WorkerTaskResult {
        task_run: execution.task_run_list[0].clone(),
    };
    harness
        .worker_task_result_queue
        .emit(replayed)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.terminal_count(id), terminal_count);
}

#[tokio::test]
async fn test_scheduler_fires_cron_trigger_and_advances_bookmark() {
    let harness = Harness::start();

    // a sub-minute schedule so the test observes a fire quickly
    let schedule = Schedule::new("every-second", "* * * * * *");
    let flow = Flow::new(
        "cron-flow",
        "io.choreo.tests",
        1,
        vec![Task::leaf("tick", "ok", json!({}))],
    )
    .with_triggers(vec![TriggerConfig::Schedule(schedule)]);

    harness.register_flow(flow.clone()).await;
    harness.scheduler.run();

    // an execution fires, completes, and the bookmark records it
    let mut fired = Vec::new();
    for _ in 0..800 {
        fired = harness.executions_of_flow("cron-flow");
        if fired.iter().any(|e| e.state.is_terminated()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    harness.scheduler.close();

    let terminated = fired.iter().find(|e| e.state.is_terminated());
    let terminated = terminated.expect("the schedule never fired an execution");
    assert_eq!(terminated.state.current(), StateType::Success);
    assert_eq!(terminated.trigger.as_ref().unwrap().id, "every-second");

    let bookmarks = harness.trigger_store.find_all().await.unwrap();
    assert_eq!(bookmarks.len(), 1);
    assert!(bookmarks[0].execution_id.is_some());

    // the indexer observed what the bookmark points to
    let bookmarked = harness
        .repository
        .find_by_id(bookmarks[0].execution_id.unwrap())
        .await
        .unwrap();
    assert!(bookmarked.is_some());
}
