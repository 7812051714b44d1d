use tracing::info;

use crate::error::StateError;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum SessionState {
    #[display("IDLE")]
    Idle,
    #[display("ACTIVE")]
    Active,
    #[display("EVICTING")]
    Evicting,
}

/// The per-session automaton: `IDLE → ACTIVE → EVICTING → IDLE`, plus the
/// direct `ACTIVE → IDLE` shortcut for clean teardown.
///
/// The machine is advisory: it documents and enforces the order in which
/// timers, mutex, and transport operations may run, but owns none of them.
#[derive(Debug)]
pub struct StateMachine {
    current: SessionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: SessionState::Idle,
        }
    }
}

impl StateMachine {
    #[must_use]
    pub fn current(&self) -> SessionState {
        self.current
    }

    /// Applies one transition, logging the human reason.
    ///
    /// # Errors
    ///
    /// Returns a [`StateError`] for any pair outside the legal set.
    pub fn transition(&mut self, to: SessionState, reason: &'static str) -> Result<(), StateError> {
        use SessionState::{Active, Evicting, Idle};

        let legal = matches!(
            (self.current, to),
            (Idle, Active) | (Active, Evicting) | (Active, Idle) | (Evicting, Idle)
        );
        if !legal {
            return Err(StateError {
                from: self.current,
                to,
                reason,
            });
        }

        info!(from = %self.current, to = %to, reason, "session state transition");
        self.current = to;
        Ok(())
    }
}
