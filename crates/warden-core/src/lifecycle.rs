//! Agent lifecycle state machine.
//!
//! The machine is pure: it validates transitions against a fixed table
//! and appends to its own history. Publishing lifecycle events and
//! driving sandboxes happens in the runtime layer, which owns one
//! machine per agent behind a per-agent lock.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Timestamp;

/// The lifecycle states an agent can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Record exists; nothing started yet.
    Created,
    /// Sandbox is being spawned.
    Initializing,
    /// Idle and able to accept work.
    Ready,
    /// A task is executing.
    Running,
    /// Suspended by an operator.
    Paused,
    /// Exceeded its error threshold or failed to start.
    Error,
    /// Final state; nothing leaves it.
    Terminated,
}

impl AgentState {
    /// Whether this state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// The wire name, as used in `agent.<state>` event types.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events that drive lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Begin sandbox startup.
    Initialize,
    /// Sandbox reported ready.
    Ready,
    /// A task was dispatched.
    Start,
    /// The running task finished.
    Complete,
    /// Operator suspension.
    Pause,
    /// Operator resume.
    Resume,
    /// Startup or task failure past the threshold.
    Fail,
    /// Recovered from the error state.
    Recover,
    /// Final shutdown.
    Terminate,
}

impl LifecycleEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Ready => "ready",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Fail => "fail",
            Self::Recover => "recover",
            Self::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// State before the transition.
    pub from: AgentState,
    /// State after the transition.
    pub to: AgentState,
    /// The event that caused it.
    pub event: LifecycleEvent,
    /// Optional human-readable reason.
    pub reason: Option<String>,
    /// When the transition happened.
    pub timestamp: Timestamp,
}

/// Rejected transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// The event is not valid in the current state.
    #[error("invalid transition: {event} in state {state}")]
    InvalidTransition {
        /// Current state.
        state: AgentState,
        /// The rejected event.
        event: LifecycleEvent,
    },
    /// The agent is terminated; no further transitions exist.
    #[error("agent is terminated")]
    Terminated,
}

/// Compute the target state for `event` from `state`, if the transition
/// is in the table.
#[must_use]
pub fn next_state(state: AgentState, event: LifecycleEvent) -> Option<AgentState> {
    use AgentState as S;
    use LifecycleEvent as E;

    match (state, event) {
        (S::Created, E::Initialize) => Some(S::Initializing),
        (S::Initializing, E::Ready) => Some(S::Ready),
        (S::Ready, E::Start) => Some(S::Running),
        (S::Running, E::Complete) => Some(S::Ready),
        (S::Ready | S::Running, E::Pause) => Some(S::Paused),
        (S::Paused, E::Resume) => Some(S::Ready),
        (S::Initializing | S::Running, E::Fail) => Some(S::Error),
        (S::Error, E::Recover) => Some(S::Ready),
        (s, E::Terminate) if !s.is_terminal() => Some(S::Terminated),
        _ => None,
    }
}

/// Per-agent lifecycle machine with transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleMachine {
    state: AgentState,
    history: Vec<TransitionRecord>,
}

impl LifecycleMachine {
    /// A new machine in [`AgentState::Created`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AgentState::Created,
            history: Vec::new(),
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The recorded transition history, oldest first.
    #[must_use]
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Apply `event`, returning the recorded transition.
    ///
    /// On rejection the state is unchanged and nothing is appended.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Terminated`] once the machine is terminal,
    /// [`LifecycleError::InvalidTransition`] for any event outside the
    /// transition table.
    pub fn apply(
        &mut self,
        event: LifecycleEvent,
        reason: Option<String>,
    ) -> Result<TransitionRecord, LifecycleError> {
        if self.state.is_terminal() {
            return Err(LifecycleError::Terminated);
        }
        let to = next_state(self.state, event).ok_or(LifecycleError::InvalidTransition {
            state: self.state,
            event,
        })?;

        let record = TransitionRecord {
            from: self.state,
            to,
            event,
            reason,
            timestamp: Timestamp::now(),
        };
        self.state = to;
        self.history.push(record.clone());
        Ok(record)
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}
