use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::core::execution::{Execution, ExecutionTrigger};
use crate::core::flow::Flow;
use crate::core::renderer::Renderer;
use crate::core::state::StateType;

/// Static condition attached to a flow trigger, matched against the upstream
/// execution that just terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// The upstream execution must belong to this flow.
    ExecutionFlow { namespace: String, flow_id: String },
    /// The upstream execution's final state must be one of these.
    ExecutionStatus { states: Vec<StateType> },
}

impl TriggerCondition {
    pub fn is_valid(&self, execution: &Execution) -> bool {
        match self {
            TriggerCondition::ExecutionFlow { namespace, flow_id } => {
                &execution.namespace == namespace && &execution.flow_id == flow_id
            }
            TriggerCondition::ExecutionStatus { states } => {
                states.contains(&execution.state.current())
            }
        }
    }
}

/// Upstream-completion trigger: fires a new execution of the declaring flow
/// whenever another flow's execution terminates and every condition matches.
///
/// Without conditions this matches every terminated execution of every flow,
/// so real definitions always constrain it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTrigger {
    pub id: String,

    /// Input templates for the triggered execution, rendered against the
    /// upstream execution's outputs.
    #[serde(default)]
    pub inputs: Option<Map<String, Value>>,

    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,

    #[serde(default)]
    pub disabled: bool,
}

impl FlowTrigger {
    /// Evaluate against a terminated upstream execution. Returns the chained
    /// execution to emit, or `None` when conditions do not match or an input
    /// template fails to render (the firing is abandoned, logged, and must
    /// not affect anything else).
    pub fn evaluate(
        &self,
        renderer: &dyn Renderer,
        flow: &Flow,
        current: &Execution,
    ) -> Option<Execution> {
        if self.disabled {
            return None;
        }

        if !self.conditions.iter().all(|c| c.is_valid(current)) {
            return None;
        }

        let outputs = Self::merged_outputs(current);
        let vars = json!({
            "trigger": {
                "execution_id": current.id,
                "namespace": current.namespace,
                "flow_id": current.flow_id,
                "flow_revision": current.flow_revision,
                "state": current.state.current(),
                "outputs": outputs,
            }
        });

        let inputs = match &self.inputs {
            None => None,
            Some(templates) => {
                let mut rendered = Map::new();
                for (key, template) in templates {
                    let template = match template {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };

                    match renderer.render(&template, &vars) {
                        Ok(value) => {
                            rendered.insert(key.clone(), value);
                        }
                        Err(e) => {
                            warn!(
                                namespace = %flow.namespace,
                                flow = %flow.id,
                                trigger = %self.id,
                                "failed to trigger flow, invalid inputs: {}",
                                e
                            );
                            return None;
                        }
                    }
                }
                Some(Value::Object(rendered))
            }
        };

        Some(
            Execution::new(flow, inputs).with_trigger(ExecutionTrigger {
                id: self.id.clone(),
                variables: vars["trigger"].clone(),
            }),
        )
    }

    /// Outputs of the upstream execution keyed by task id, for template vars.
    fn merged_outputs(execution: &Execution) -> Value {
        let mut outputs = Map::new();
        for task_run in &execution.task_run_list {
            if let Some(value) = &task_run.outputs {
                outputs.insert(task_run.task_id.clone(), value.clone());
            }
        }
        Value::Object(outputs)
    }
}
