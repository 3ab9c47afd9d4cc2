use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use super::error::CoreError;

/// Lifecycle stage of an execution or task run.
///
/// `Created` is neither running nor terminal: it marks a task run that has
/// been resolved but not yet acknowledged by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    Created,
    Running,
    Restarted,
    Killing,
    Success,
    Warning,
    Failed,
    Killed,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Created => "CREATED",
            StateType::Running => "RUNNING",
            StateType::Restarted => "RESTARTED",
            StateType::Killing => "KILLING",
            StateType::Success => "SUCCESS",
            StateType::Warning => "WARNING",
            StateType::Failed => "FAILED",
            StateType::Killed => "KILLED",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            StateType::Success | StateType::Warning | StateType::Failed | StateType::Killed
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            StateType::Running | StateType::Restarted | StateType::Killing
        )
    }

    pub fn is_created(&self) -> bool {
        matches!(self, StateType::Created)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StateType::Failed)
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StateType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(StateType::Created),
            "RUNNING" => Ok(StateType::Running),
            "RESTARTED" => Ok(StateType::Restarted),
            "KILLING" => Ok(StateType::Killing),
            "SUCCESS" => Ok(StateType::Success),
            "WARNING" => Ok(StateType::Warning),
            "FAILED" => Ok(StateType::Failed),
            "KILLED" => Ok(StateType::Killed),
            _ => Err(CoreError::InvalidStateType(s.to_string())),
        }
    }
}

/// One entry of a state's append-only transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHistory {
    pub state: StateType,
    pub date: DateTime<Utc>,
}

/// Immutable lifecycle value: the current stage plus the full ordered history
/// of transitions that led to it.
///
/// Transitions go through [`State::with_state`], which appends to the history;
/// a transition to the current type is refused (logged, returns the value
/// unchanged) so replayed events cannot forge duplicate history entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    current: StateType,
    histories: Vec<StateHistory>,
}

impl State {
    /// A fresh `CREATED` state with a single history entry.
    pub fn new() -> Self {
        Self::of(StateType::Created)
    }

    pub fn of(state: StateType) -> Self {
        Self {
            current: state,
            histories: vec![StateHistory {
                state,
                date: Utc::now(),
            }],
        }
    }

    pub fn current(&self) -> StateType {
        self.current
    }

    pub fn histories(&self) -> &[StateHistory] {
        &self.histories
    }

    /// Transition to a new type, appending to the history.
    ///
    /// A same-type transition is a no-op returning the state unchanged.
    pub fn with_state(&self, state: StateType) -> State {
        if self.current == state {
            warn!("can't change state, already {}", self.current);
            return self.clone();
        }

        let mut histories = self.histories.clone();
        histories.push(StateHistory {
            state,
            date: Utc::now(),
        });

        State {
            current: state,
            histories,
        }
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.histories
            .first()
            .map(|h| h.date)
            .unwrap_or_else(Utc::now)
    }

    /// End date is only defined once the state is terminal.
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        if !self.is_terminated() {
            return None;
        }

        self.histories.last().map(|h| h.date)
    }

    pub fn duration(&self) -> Duration {
        match self.end_date() {
            Some(end) => end - self.start_date(),
            None => Utc::now() - self.start_date(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.current.is_terminated()
    }

    pub fn is_running(&self) -> bool {
        self.current.is_running()
    }

    pub fn is_created(&self) -> bool {
        self.current.is_created()
    }

    pub fn is_failed(&self) -> bool {
        self.current.is_failed()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_type_conversion() {
        for state in [
            StateType::Created,
            StateType::Running,
            StateType::Restarted,
            StateType::Killing,
            StateType::Success,
            StateType::Warning,
            StateType::Failed,
            StateType::Killed,
        ] {
            assert_eq!(StateType::from_str(state.as_str()).unwrap(), state);
        }

        assert!(StateType::from_str("PENDING").is_err());
    }

    #[test]
    fn test_state_classification() {
        assert!(!StateType::Created.is_running());
        assert!(!StateType::Created.is_terminated());
        assert!(StateType::Restarted.is_running());
        assert!(StateType::Killing.is_running());
        assert!(StateType::Warning.is_terminated());
        assert!(StateType::Killed.is_terminated());
        assert!(!StateType::Failed.is_running());
    }

    #[test]
    fn test_with_state_appends_history() {
        let state = State::new();
        assert_eq!(state.current(), StateType::Created);
        assert_eq!(state.histories().len(), 1);

        let state = state.with_state(StateType::Running);
        let state = state.with_state(StateType::Success);

        assert_eq!(state.current(), StateType::Success);
        assert_eq!(state.histories().len(), 3);
        assert_eq!(state.histories()[0].state, StateType::Created);
        assert_eq!(state.histories()[1].state, StateType::Running);
        assert_eq!(state.histories()[2].state, StateType::Success);
    }

    #[test]
    fn test_with_state_refuses_same_type() {
        let state = State::new().with_state(StateType::Running);
        let unchanged = state.with_state(StateType::Running);

        assert_eq!(unchanged, state);
        assert_eq!(unchanged.histories().len(), 2);
    }

    #[test]
    fn test_end_date_only_when_terminated() {
        let state = State::new().with_state(StateType::Running);
        assert!(state.end_date().is_none());

        let state = state.with_state(StateType::Success);
        assert!(state.end_date().is_some());
        assert!(state.duration() >= Duration::zero());
    }
}
