use serde::{Deserialize, Serialize};

use super::error::{CoreError, Result};
use super::task::Task;
use super::trigger::TriggerConfig;

/// A flow definition: the declarative task DAG plus its triggers.
///
/// Immutable once loaded for a given revision; a new revision is a new value,
/// never an in-place edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub namespace: String,
    pub revision: u32,
    pub tasks: Vec<Task>,

    /// Flow-level error branch, followed when a top-level task fails.
    #[serde(default)]
    pub errors: Vec<Task>,

    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub deleted: bool,
}

impl Flow {
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        revision: u32,
        tasks: Vec<Task>,
    ) -> Self {
        Flow {
            id: id.into(),
            namespace: namespace.into(),
            revision,
            tasks,
            errors: Vec::new(),
            triggers: Vec::new(),
            disabled: false,
            deleted: false,
        }
    }

    pub fn with_errors(mut self, errors: Vec<Task>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_triggers(mut self, triggers: Vec<TriggerConfig>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn uid(&self) -> String {
        format!("{}_{}_{}", self.namespace, self.id, self.revision)
    }

    pub fn uid_without_revision(&self) -> String {
        format!("{}_{}", self.namespace, self.id)
    }

    /// Recursive task lookup across the task tree and error branches.
    pub fn find_task_by_id(&self, task_id: &str) -> Result<&Task> {
        self.tasks
            .iter()
            .chain(self.errors.iter())
            .find_map(|task| task.find_by_id(task_id))
            .ok_or_else(|| CoreError::TaskNotFound {
                task_id: task_id.to_string(),
                flow_uid: self.uid(),
            })
    }

    pub fn find_trigger_by_id(&self, trigger_id: &str) -> Option<&TriggerConfig> {
        self.triggers.iter().find(|t| t.id() == trigger_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uid() {
        let flow = Flow::new("daily-report", "io.choreo.tests", 3, vec![]);
        assert_eq!(flow.uid(), "io.choreo.tests_daily-report_3");
        assert_eq!(flow.uid_without_revision(), "io.choreo.tests_daily-report");
    }

    #[test]
    fn test_find_task_by_id_nested() {
        let flow = Flow::new(
            "nested",
            "io.choreo.tests",
            1,
            vec![Task::sequential(
                "container",
                vec![Task::leaf("inner", "noop", json!({}))],
            )],
        )
        .with_errors(vec![Task::leaf("on-error", "noop", json!({}))]);

        assert!(flow.find_task_by_id("container").is_ok());
        assert!(flow.find_task_by_id("inner").is_ok());
        assert!(flow.find_task_by_id("on-error").is_ok());
        assert!(flow.find_task_by_id("nope").is_err());
    }
}
