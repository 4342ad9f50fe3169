use thiserror::Error;

/// High-level phases a referee session goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Looking for the resource directory and the registered players.
    Discovering,
    /// Sending role assignments to the discovered players.
    Assigning,
    /// Subscriptions are live and counts are flowing in.
    Observing,
    /// A winner was declared for the current round.
    Finished,
}

/// Events that can be applied to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The directory returned at least one player.
    PlayersDiscovered,
    /// Every role command was attempted.
    RolesAssigned,
    /// A player reached the threshold.
    WinnerDeclared,
    /// The operator reset the game.
    Reset,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the invalid event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: SessionEvent,
}

/// State machine implementing the session flow.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Discovering,
        }
    }
}

impl SessionStateMachine {
    /// Create a new state machine initialised in the discovering phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Apply `event`, returning the new phase.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let next = self.compute_transition(event)?;
        self.phase = next;
        Ok(next)
    }

    fn compute_transition(&self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (SessionPhase::Discovering, SessionEvent::PlayersDiscovered) => SessionPhase::Assigning,
            (SessionPhase::Assigning, SessionEvent::RolesAssigned) => SessionPhase::Observing,
            (SessionPhase::Observing, SessionEvent::WinnerDeclared) => SessionPhase::Finished,
            (SessionPhase::Observing | SessionPhase::Finished, SessionEvent::Reset) => {
                SessionPhase::Observing
            }
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}
