//! Trigger model: the persisted bookmark, its evaluation context, and the
//! closed set of trigger configurations a flow may declare.
//!
//! The scheduler only ever talks to the polling capability
//! ([`TriggerConfig::is_polling`], [`TriggerConfig::next_evaluation_date`],
//! [`TriggerConfig::evaluate_polling`]); concrete trigger types stay behind
//! the variant dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

mod flow;
mod schedule;

pub use flow::{FlowTrigger, TriggerCondition};
pub use schedule::{Backfill, Schedule, ScheduleCondition};

use super::error::Result;
use super::execution::Execution;

/// Per-(flow, trigger) evaluation unit: where and when a trigger is being
/// evaluated. Uniquely keyed by `uid()` independent of the date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    pub trigger_id: String,
    pub date: DateTime<Utc>,
}

impl TriggerContext {
    /// The scheduler's bookmark key.
    pub fn uid(&self) -> String {
        format!("{}_{}_{}", self.namespace, self.flow_id, self.trigger_id)
    }
}

/// The persisted trigger bookmark: last evaluated date plus the execution it
/// produced. Created lazily on first evaluation, updated on every fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub namespace: String,
    pub flow_id: String,
    pub flow_revision: u32,
    pub trigger_id: String,
    pub date: DateTime<Utc>,
    pub execution_id: Option<Uuid>,
    pub updated_date: Option<DateTime<Utc>>,
}

impl Trigger {
    pub fn uid(&self) -> String {
        format!("{}_{}_{}", self.namespace, self.flow_id, self.trigger_id)
    }

    /// A bookmark with no execution information.
    pub fn of(context: &TriggerContext) -> Self {
        Trigger {
            namespace: context.namespace.clone(),
            flow_id: context.flow_id.clone(),
            flow_revision: context.flow_revision,
            trigger_id: context.trigger_id.clone(),
            date: context.date,
            execution_id: None,
            updated_date: None,
        }
    }

    /// A bookmark recording a fire: the evaluated date plus the produced
    /// execution. Saving this and emitting the execution form one logical
    /// unit on the scheduler side.
    pub fn with_execution(context: &TriggerContext, execution: &Execution) -> Self {
        Trigger {
            namespace: context.namespace.clone(),
            flow_id: context.flow_id.clone(),
            flow_revision: context.flow_revision,
            trigger_id: context.trigger_id.clone(),
            date: context.date,
            execution_id: Some(execution.id),
            updated_date: Some(Utc::now()),
        }
    }
}

/// Closed set of trigger configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Cron-date polling trigger, evaluated by the scheduler loop.
    Schedule(Schedule),

    /// Fires when an upstream flow's execution terminates; evaluated by the
    /// executor on terminal executions, never polled.
    Flow(FlowTrigger),

    /// Fired externally through the API surface; carried here so the flow
    /// definition is complete, but payload handling stays out of the core.
    Webhook(Webhook),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub disabled: bool,
}

impl TriggerConfig {
    pub fn id(&self) -> &str {
        match self {
            TriggerConfig::Schedule(schedule) => &schedule.id,
            TriggerConfig::Flow(flow) => &flow.id,
            TriggerConfig::Webhook(webhook) => &webhook.id,
        }
    }

    pub fn disabled(&self) -> bool {
        match self {
            TriggerConfig::Schedule(schedule) => schedule.disabled,
            TriggerConfig::Flow(flow) => flow.disabled,
            TriggerConfig::Webhook(webhook) => webhook.disabled,
        }
    }

    /// Whether the scheduler loop owns the evaluation of this trigger.
    pub fn is_polling(&self) -> bool {
        matches!(self, TriggerConfig::Schedule(_))
    }

    /// Minimum interval between evaluations; `None` for pure cron-date
    /// triggers, which are checked every tick.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            TriggerConfig::Schedule(schedule) => schedule.interval,
            _ => None,
        }
    }

    /// Next evaluation date per the trigger's polling policy, given the last
    /// bookmark if any.
    pub fn next_evaluation_date(&self, last: Option<&Trigger>) -> Result<Option<DateTime<Utc>>> {
        match self {
            TriggerConfig::Schedule(schedule) => schedule.next_evaluation_date(last),
            _ => Ok(None),
        }
    }

    /// Evaluate a polling trigger at the given context; `Ok(None)` means the
    /// trigger is not due.
    pub fn evaluate_polling(&self, context: &TriggerContext) -> Result<Option<Execution>> {
        match self {
            TriggerConfig::Schedule(schedule) => schedule.evaluate(context),
            _ => Ok(None),
        }
    }
}
