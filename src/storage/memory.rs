use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{ExecutionRepository, Result, TriggerStore};
use crate::core::{Execution, Trigger, TriggerContext};
use crate::queue::{Handler, Queue};

/// In-memory trigger bookmark store.
#[derive(Default)]
pub struct MemoryTriggerStore {
    triggers: DashMap<String, Trigger>,
    tombstones: DashSet<String>,
}

impl MemoryTriggerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerStore for MemoryTriggerStore {
    async fn find_last(&self, context: &TriggerContext) -> Result<Option<Trigger>> {
        Ok(self.triggers.get(&context.uid()).map(|t| t.clone()))
    }

    async fn find_all(&self) -> Result<Vec<Trigger>> {
        Ok(self.triggers.iter().map(|t| t.clone()).collect())
    }

    async fn save(&self, trigger: Trigger) -> Result<()> {
        let uid = trigger.uid();

        if self.tombstones.contains(&uid) {
            debug!(uid = %uid, "ignoring save for tombstoned trigger");
            return Ok(());
        }

        self.triggers.insert(uid, trigger);
        Ok(())
    }

    async fn delete(&self, context: &TriggerContext) -> Result<()> {
        let uid = context.uid();
        self.tombstones.insert(uid.clone());
        self.triggers.remove(&uid);
        Ok(())
    }
}

/// In-memory execution repository; acts as the indexer when subscribed to
/// the execution queue.
#[derive(Default)]
pub struct MemoryExecutionRepository {
    executions: DashMap<Uuid, Execution>,
}

impl MemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe this repository to an execution queue so every emitted
    /// update lands in the index, the way a standalone indexer would.
    pub fn index_from(self: &Arc<Self>, queue: &dyn Queue<Execution>) {
        let repository = Arc::clone(self);

        let handler: Handler<Execution> = Arc::new(move |execution| {
            let repository = Arc::clone(&repository);
            Box::pin(async move {
                repository.executions.insert(execution.id, execution);
            })
        });

        queue.receive("indexer", handler);
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.executions.get(&id).map(|e| e.clone()))
    }

    async fn save(&self, execution: Execution) -> Result<()> {
        self.executions.insert(execution.id, execution);
        Ok(())
    }
}
