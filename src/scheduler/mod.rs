//! Trigger scheduler: the continuously ticking evaluation loop.
//!
//! Once per second the scheduler walks its cached set of (flow, polling
//! trigger) pairs and decides, for each, whether it is due to fire, must
//! wait (its previous firing is still in flight), or is skipped (interval
//! debounce, future date). Due triggers are forwarded to a worker as
//! [`WorkerTrigger`] jobs; successful evaluations come back as
//! [`WorkerTriggerResult`]s, advance the persisted trigger bookmark and emit
//! the produced execution.
//!
//! The schedulable set is recomputed off the tick task whenever the flow
//! catalog changes and published as an atomically swapped immutable
//! snapshot; the tick task never observes a partially built set.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::core::{Execution, Flow, Trigger, TriggerConfig, TriggerContext};
use crate::executor::{WorkerJob, WorkerTrigger, WorkerTriggerResult};
use crate::listeners::FlowListeners;
use crate::queue::{Handler, Queue};
use crate::storage::{ExecutionRepository, TriggerStore};

/// Grace period before a bookmark pointing at an unknown execution is
/// reported as stuck; below it the miss is treated as indexer lag.
const EXECUTION_MISSING_GRACE: Duration = Duration::from_secs(60);

/// One schedulable unit: an enabled flow paired with one of its polling
/// triggers.
#[derive(Debug, Clone)]
pub struct FlowWithPollingTrigger {
    pub flow: Flow,
    pub trigger: TriggerConfig,
}

impl FlowWithPollingTrigger {
    pub fn context(&self, date: DateTime<Utc>) -> TriggerContext {
        TriggerContext {
            namespace: self.flow.namespace.clone(),
            flow_id: self.flow.id.clone(),
            flow_revision: self.flow.revision,
            trigger_id: self.trigger.id().to_string(),
            date,
        }
    }

    pub fn uid(&self) -> String {
        format!(
            "{}_{}_{}",
            self.flow.namespace,
            self.flow.id,
            self.trigger.id()
        )
    }
}

/// Mutable per-trigger bookkeeping, owned by the scheduler and guarded by a
/// single lock. The tick task is the only writer of `running` marks (results
/// only clear them), so guard-then-mark within one tick is atomic.
#[derive(Default)]
struct SchedulerState {
    /// Last time each trigger's evaluation interval was consumed.
    last_evaluate: HashMap<String, DateTime<Utc>>,
    /// Triggers submitted to a worker whose result has not returned yet.
    running: HashMap<String, DateTime<Utc>>,
    /// Cached next evaluation date per trigger, for observability.
    schedulable_next_date: HashMap<String, DateTime<Utc>>,
}

impl SchedulerState {
    /// Interval debounce: triggers with no declared interval are checked
    /// every tick; otherwise evaluation proceeds only once per interval, and
    /// `last_evaluate` advances only when it does.
    fn evaluation_interval_due(
        &mut self,
        uid: &str,
        interval: Option<Duration>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(interval) = interval else {
            return true;
        };

        let Ok(interval) = ChronoDuration::from_std(interval) else {
            return true;
        };

        match self.last_evaluate.get(uid) {
            None => {
                self.last_evaluate.insert(uid.to_string(), now);
                true
            }
            Some(last) => {
                if *last + interval < now {
                    self.last_evaluate.insert(uid.to_string(), now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn forget(&mut self, uid: &str) {
        self.last_evaluate.remove(uid);
        self.running.remove(uid);
        self.schedulable_next_date.remove(uid);
    }
}

pub struct Scheduler {
    flow_listeners: Arc<FlowListeners>,
    trigger_store: Arc<dyn TriggerStore>,
    execution_repository: Arc<dyn ExecutionRepository>,
    execution_queue: Arc<dyn Queue<Execution>>,
    worker_job_queue: Arc<dyn Queue<WorkerJob>>,
    worker_trigger_result_queue: Arc<dyn Queue<WorkerTriggerResult>>,
    state: Mutex<SchedulerState>,
    schedulable: RwLock<Arc<Vec<FlowWithPollingTrigger>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        flow_listeners: Arc<FlowListeners>,
        trigger_store: Arc<dyn TriggerStore>,
        execution_repository: Arc<dyn ExecutionRepository>,
        execution_queue: Arc<dyn Queue<Execution>>,
        worker_job_queue: Arc<dyn Queue<WorkerJob>>,
        worker_trigger_result_queue: Arc<dyn Queue<WorkerTriggerResult>>,
    ) -> Arc<Self> {
        Arc::new(Scheduler {
            flow_listeners,
            trigger_store,
            execution_repository,
            execution_queue,
            worker_job_queue,
            worker_trigger_result_queue,
            state: Mutex::new(SchedulerState::default()),
            schedulable: RwLock::new(Arc::new(Vec::new())),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the scheduler: subscribe to catalog changes and trigger
    /// results, then spawn the serialized one-second ticker.
    pub fn run(self: &Arc<Self>) {
        // recompute the schedulable snapshot on every catalog change
        let scheduler = Arc::clone(self);
        self.flow_listeners.listen(move |flows| {
            scheduler.compute_schedulable(flows);
        });

        // drop bookmarks of removed flows/triggers
        let scheduler = Arc::clone(self);
        self.flow_listeners.listen_each(move |flow, previous| {
            let scheduler = Arc::clone(&scheduler);
            let flow = flow.clone();
            let previous = previous.cloned();
            tokio::spawn(async move {
                scheduler.handle_flow_change(flow, previous).await;
            });
        });

        // trigger evaluation results coming back from workers
        let scheduler = Arc::clone(self);
        let handler: Handler<WorkerTriggerResult> = Arc::new(move |result| {
            let scheduler = Arc::clone(&scheduler);
            Box::pin(async move {
                scheduler.on_trigger_result(result).await;
            })
        });
        self.worker_trigger_result_queue.receive("scheduler", handler);

        // the tick loop: strictly serialized, one tick completes before the
        // next is scheduled
        let scheduler = Arc::clone(self);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                scheduler.handle().await;
            }
        });

        // a panicking tick leaves the loop state unknown: terminate rather
        // than continue, this is the single non-recoverable path
        tokio::spawn(async move {
            if let Err(e) = ticker.await {
                if e.is_panic() {
                    error!("scheduler fatal exception: {:?}", e);
                    std::process::exit(1);
                }
            }
        });
    }

    /// Stop the ticker. Bookmarks already marked running need no recovery:
    /// readiness is recomputed from persisted state on restart, and a
    /// bookmark pointing at a non-terminal execution simply stays not ready
    /// until that execution concludes.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn compute_schedulable(&self, flows: &[Flow]) {
        let schedulable: Vec<FlowWithPollingTrigger> = flows
            .iter()
            .filter(|flow| !flow.disabled && !flow.deleted)
            .flat_map(|flow| {
                flow.triggers
                    .iter()
                    .filter(|trigger| trigger.is_polling() && !trigger.disabled())
                    .map(|trigger| FlowWithPollingTrigger {
                        flow: flow.clone(),
                        trigger: trigger.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        debug!("recomputed schedulable set: {} triggers", schedulable.len());

        let mut guard = self.schedulable.write().expect("schedulable lock poisoned");
        *guard = Arc::new(schedulable);
    }

    fn schedulable_snapshot(&self) -> Arc<Vec<FlowWithPollingTrigger>> {
        Arc::clone(&self.schedulable.read().expect("schedulable lock poisoned"))
    }

    /// One tick of the evaluation loop.
    async fn handle(&self) {
        let now = Self::now();
        let schedulable = self.schedulable_snapshot();

        trace!(
            "scheduler next iteration for {} with {} schedulables",
            now,
            schedulable.len()
        );

        for flow_with_trigger in schedulable.iter() {
            let uid = flow_with_trigger.uid();

            // interval debounce and running guard, checked together with
            // marking under the single state lock of this tick
            {
                let mut state = self.state.lock().await;

                if state.running.contains_key(&uid) {
                    continue;
                }

                if !state.evaluation_interval_due(
                    &uid,
                    flow_with_trigger.trigger.interval(),
                    now,
                ) {
                    continue;
                }
            }

            let last = match self.last_trigger(flow_with_trigger, now).await {
                Ok(last) => last,
                Err(e) => {
                    warn!(uid = %uid, "unable to load trigger bookmark: {}", e);
                    continue;
                }
            };

            if !self.is_execution_not_running(&last, now).await {
                continue;
            }

            let next = match flow_with_trigger.trigger.next_evaluation_date(Some(&last)) {
                Ok(Some(next)) => next,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        uid = %uid,
                        date = %now,
                        "evaluate failed with error '{}'",
                        e
                    );
                    continue;
                }
            };

            let due = {
                let mut state = self.state.lock().await;
                state.schedulable_next_date.insert(uid.clone(), next);

                if next > now {
                    false
                } else {
                    // mark running before dispatch: at most one in-flight
                    // evaluation per trigger uid
                    state.running.insert(uid.clone(), now);
                    true
                }
            };

            if !due {
                continue;
            }

            debug!(uid = %uid, date = %next, "scheduling evaluation to the worker");

            let worker_trigger = WorkerTrigger {
                flow: flow_with_trigger.flow.clone(),
                trigger: flow_with_trigger.trigger.clone(),
                context: flow_with_trigger.context(next),
            };

            if let Err(e) = self
                .worker_job_queue
                .emit(WorkerJob::Trigger(worker_trigger))
                .await
            {
                error!(uid = %uid, "unable to send worker trigger to worker: {}", e);
                let mut state = self.state.lock().await;
                state.running.remove(&uid);
            }
        }
    }

    /// The last bookmark for this trigger, or a bootstrap one when none was
    /// ever saved: seeded from the trigger's configured backfill start or
    /// now, whichever is earlier, so backfills replay from a fixed
    /// historical start rather than "now".
    async fn last_trigger(
        &self,
        flow_with_trigger: &FlowWithPollingTrigger,
        now: DateTime<Utc>,
    ) -> crate::storage::Result<Trigger> {
        let context = flow_with_trigger.context(now);

        if let Some(last) = self.trigger_store.find_last(&context).await? {
            return Ok(last);
        }

        let seed = match flow_with_trigger.trigger.next_evaluation_date(None) {
            Ok(Some(date)) if date < now => date,
            _ => now,
        };

        Ok(Trigger::of(&flow_with_trigger.context(seed)))
    }

    /// The execution-not-running guard: ready only when the bookmarked
    /// execution is terminal or was never recorded. A missing execution is
    /// treated as read-after-write lag and stays "not ready"; it is logged
    /// as stuck only past the grace period.
    async fn is_execution_not_running(&self, last: &Trigger, now: DateTime<Utc>) -> bool {
        let Some(execution_id) = last.execution_id else {
            return true;
        };

        let execution = match self.execution_repository.find_by_id(execution_id).await {
            Ok(execution) => execution,
            Err(e) => {
                warn!(uid = %last.uid(), "unable to look up execution: {}", e);
                return false;
            }
        };

        let Some(execution) = execution else {
            let grace = ChronoDuration::from_std(EXECUTION_MISSING_GRACE)
                .unwrap_or_else(|_| ChronoDuration::seconds(60));

            let stuck = last
                .updated_date
                .map_or(true, |updated| updated + grace < now);

            if stuck {
                warn!(
                    uid = %last.uid(),
                    execution = %execution_id,
                    "execution is not found, schedule is blocked since {:?}",
                    last.updated_date
                );
            }

            return false;
        };

        if execution.state.is_terminated() {
            return true;
        }

        debug!(
            uid = %last.uid(),
            execution = %execution_id,
            state = %execution.state.current(),
            "execution is still running, waiting for it to terminate"
        );

        false
    }

    /// Fold a worker's trigger evaluation back: clear the running mark, and
    /// on a successful evaluation persist the new bookmark then emit the
    /// execution. The save comes first so a crash between the two blocks on
    /// the execution-not-running guard instead of firing the date twice.
    async fn on_trigger_result(&self, result: WorkerTriggerResult) {
        let uid = result.context.uid();

        {
            let mut state = self.state.lock().await;
            if state.running.remove(&uid).is_none() {
                warn!(uid = %uid, "can't remove trigger from running");
            }
        }

        if !result.success {
            return;
        }

        let Some(execution) = result.execution else {
            trace!(uid = %uid, date = %result.context.date, "empty evaluation, waiting");
            return;
        };

        let trigger = Trigger::with_execution(&result.context, &execution);

        if let Err(e) = self.trigger_store.save(trigger).await {
            error!(uid = %uid, "unable to save trigger bookmark, not emitting: {}", e);
            return;
        }

        info!(
            uid = %uid,
            execution = %execution.id,
            date = %result.context.date,
            "scheduled execution at '{}'",
            result.context.date
        );

        if let Err(e) = self.execution_queue.emit(execution).await {
            // the bookmark already advanced; the guard will report this
            // execution as missing until the emission is retried elsewhere
            error!(uid = %uid, "unable to emit scheduled execution: {}", e);
        }
    }

    /// Drop bookmarks for removed flows or removed triggers, under the state
    /// lock so a concurrent tick cannot resurrect them mid-evaluation.
    async fn handle_flow_change(&self, flow: Flow, previous: Option<Flow>) {
        let removed: Vec<TriggerContext> = if flow.deleted {
            flow.triggers
                .iter()
                .filter(|t| t.is_polling())
                .map(|t| TriggerContext {
                    namespace: flow.namespace.clone(),
                    flow_id: flow.id.clone(),
                    flow_revision: flow.revision,
                    trigger_id: t.id().to_string(),
                    date: Self::now(),
                })
                .collect()
        } else if let Some(previous) = &previous {
            previous
                .triggers
                .iter()
                .filter(|t| t.is_polling())
                .filter(|t| flow.find_trigger_by_id(t.id()).is_none())
                .map(|t| TriggerContext {
                    namespace: previous.namespace.clone(),
                    flow_id: previous.id.clone(),
                    flow_revision: previous.revision,
                    trigger_id: t.id().to_string(),
                    date: Self::now(),
                })
                .collect()
        } else {
            Vec::new()
        };

        if removed.is_empty() {
            return;
        }

        let mut state = self.state.lock().await;
        for context in removed {
            info!(uid = %context.uid(), "removing trigger bookmark");
            state.forget(&context.uid());

            if let Err(e) = self.trigger_store.delete(&context).await {
                error!(uid = %context.uid(), "unable to delete trigger bookmark: {}", e);
            }
        }
    }

    /// The loop works on whole seconds, like the cron dates it compares to.
    fn now() -> DateTime<Utc> {
        Utc::now()
            .duration_trunc(ChronoDuration::seconds(1))
            .unwrap_or_else(|_| Utc::now())
    }
}
