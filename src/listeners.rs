//! Flow catalog cache.
//!
//! Keeps the current set of flow definitions in memory, fed by the flow
//! queue, and notifies subscribers on every change. Consumers receive the
//! current snapshot immediately on subscription, then again after each
//! change; `listen_each` additionally exposes the previous revision of the
//! changed flow, which the scheduler needs to detect removed triggers.

use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

use crate::core::{Execution, Flow};
use crate::queue::{Handler, Queue};

type SnapshotConsumer = Box<dyn Fn(&[Flow]) + Send + Sync>;
type EachConsumer = Box<dyn Fn(&Flow, Option<&Flow>) + Send + Sync>;

pub struct FlowListeners {
    flows: RwLock<Vec<Flow>>,
    consumers: Mutex<Vec<SnapshotConsumer>>,
    consumers_each: Mutex<Vec<EachConsumer>>,
}

impl FlowListeners {
    pub fn new() -> Arc<Self> {
        Arc::new(FlowListeners {
            flows: RwLock::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            consumers_each: Mutex::new(Vec::new()),
        })
    }

    /// Start consuming flow catalog changes.
    pub fn run(self: &Arc<Self>, flow_queue: &dyn Queue<Flow>) {
        let listeners = Arc::clone(self);

        let handler: Handler<Flow> = Arc::new(move |flow| {
            let listeners = Arc::clone(&listeners);
            Box::pin(async move {
                listeners.on_flow(flow);
            })
        });

        flow_queue.receive("flow-listeners", handler);
    }

    fn on_flow(&self, flow: Flow) {
        let previous = {
            let mut flows = self.flows.write().expect("flow listeners lock poisoned");

            let previous = flows
                .iter()
                .position(|f| f.namespace == flow.namespace && f.id == flow.id)
                .map(|index| flows.remove(index));

            if !flow.deleted {
                flows.push(flow.clone());
            }

            previous
        };

        trace!(
            namespace = %flow.namespace,
            flow = %flow.id,
            deleted = flow.deleted,
            "received flow catalog change"
        );

        {
            let consumers_each = self
                .consumers_each
                .lock()
                .expect("flow listeners lock poisoned");
            for consumer in consumers_each.iter() {
                consumer(&flow, previous.as_ref());
            }
        }

        self.notify();
    }

    fn notify(&self) {
        let flows = self.flows();
        let consumers = self.consumers.lock().expect("flow listeners lock poisoned");
        for consumer in consumers.iter() {
            consumer(&flows);
        }
    }

    /// Subscribe to snapshot changes; invoked once immediately with the
    /// current snapshot.
    pub fn listen(&self, consumer: impl Fn(&[Flow]) + Send + Sync + 'static) {
        {
            let mut consumers = self.consumers.lock().expect("flow listeners lock poisoned");
            consumers.push(Box::new(consumer));
        }

        self.notify();
    }

    /// Subscribe to per-flow changes, with the previous revision when one
    /// was replaced or deleted.
    pub fn listen_each(&self, consumer: impl Fn(&Flow, Option<&Flow>) + Send + Sync + 'static) {
        let mut consumers = self
            .consumers_each
            .lock()
            .expect("flow listeners lock poisoned");
        consumers.push(Box::new(consumer));
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.flows
            .read()
            .expect("flow listeners lock poisoned")
            .clone()
    }

    /// The definition an execution runs against: exact revision when still
    /// known, otherwise the current one for the flow id.
    pub fn find_by_execution(&self, execution: &Execution) -> Option<Flow> {
        let flows = self.flows.read().expect("flow listeners lock poisoned");

        flows
            .iter()
            .find(|f| {
                f.namespace == execution.namespace
                    && f.id == execution.flow_id
                    && f.revision == execution.flow_revision
            })
            .or_else(|| {
                flows
                    .iter()
                    .filter(|f| f.namespace == execution.namespace && f.id == execution.flow_id)
                    .max_by_key(|f| f.revision)
            })
            .cloned()
    }
}
