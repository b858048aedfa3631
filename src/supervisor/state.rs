//! Supervisor session state machine.

use serde::{Deserialize, Serialize};

/// Current state of a supervisor session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Idle,
    Building,
    Launching,
    Ready,
    /// The engine exited unsolicited; commands fail fast until an explicit
    /// shutdown (restart is an external action).
    Degraded,
    ShuttingDown,
    Terminated,
}

impl SupervisorState {
    /// Returns true if no further transitions can occur.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// State machine tracking session progress and command statistics.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SupervisorState,
    commands_sent: usize,
    replies_matched: usize,
    timeouts: usize,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SupervisorState::Idle,
            commands_sent: 0,
            replies_matched: 0,
            timeouts: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn transition(&mut self, new_state: SupervisorState) {
        tracing::debug!(from = ?self.state, to = ?new_state, "State transition");
        self.state = new_state;
    }

    pub fn record_command(&mut self) {
        self.commands_sent = self.commands_sent.saturating_add(1);
    }

    pub fn record_reply(&mut self) {
        self.replies_matched = self.replies_matched.saturating_add(1);
    }

    pub fn record_timeouts(&mut self, count: usize) {
        self.timeouts = self.timeouts.saturating_add(count);
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            commands_sent: self.commands_sent,
            replies_matched: self.replies_matched,
            timeouts: self.timeouts,
        }
    }
}

/// Command traffic statistics for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    pub commands_sent: usize,
    pub replies_matched: usize,
    pub timeouts: usize,
}
