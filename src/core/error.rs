use thiserror::Error;
use uuid::Uuid;

/// Core error type for the choreo orchestration engine.
///
/// Uses `thiserror` with `#[source]` annotations to preserve error chains.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// An invalid state type string was encountered during parsing.
    #[error("invalid state type: {0}")]
    InvalidStateType(String),

    /// The requested task run was not found on the execution.
    #[error("task run not found: id={task_run_id}, execution={execution_id}")]
    TaskRunNotFound {
        task_run_id: Uuid,
        execution_id: Uuid,
    },

    /// The requested task was not found on the flow.
    #[error("task not found: id={task_id}, flow={flow_uid}")]
    TaskNotFound { task_id: String, flow_uid: String },

    /// A cron expression could not be parsed.
    #[error("invalid cron expression '{expression}'")]
    InvalidCron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },

    /// An unknown timezone name on a schedule trigger.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// A template failed to render.
    #[error("unable to render template '{template}': {reason}")]
    Render { template: String, reason: String },

    /// A dynamic task expansion produced unusable values.
    #[error("invalid expansion values: {0}")]
    InvalidExpansion(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
