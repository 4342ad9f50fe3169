use tokio::sync::broadcast;

use crate::state::{
    player::{PlayerIdentity, RoleId},
    state_machine::SessionPhase,
};

/// Announcements published by the engine and printed by the operator console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefereeEvent {
    /// The session state machine moved to a new phase.
    PhaseChanged(SessionPhase),
    /// A non-winning count arrived.
    CountUpdated {
        /// Endpoint that reported the count.
        identity: PlayerIdentity,
        /// Role held by that endpoint.
        role: RoleId,
        /// Count carried by the notification.
        count: u32,
    },
    /// A player reached the threshold first.
    WinnerDeclared {
        /// Winning endpoint.
        identity: PlayerIdentity,
        /// Role held by the winner.
        role: RoleId,
    },
    /// The operator reset every player.
    PlayersReset,
}

/// Simple broadcast hub wrapper fanning events out to the console and tests.
pub struct EventHub {
    sender: broadcast::Sender<RefereeEvent>,
}

impl EventHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<RefereeEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: RefereeEvent) {
        let _ = self.sender.send(event);
    }
}
