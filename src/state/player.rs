use std::fmt;

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

/// Network identity of a player endpoint (host info string such as `[2001:db8::1]`).
pub type PlayerIdentity = String;

/// Role assigned by the referee to a player for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RoleId(pub u16);

impl RoleId {
    /// Reserved role meaning "unassigned / off".
    pub const OFF: RoleId = RoleId(0);

    /// Whether this is a real, assigned role.
    pub fn is_assigned(self) -> bool {
        self != Self::OFF
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contest state of a single player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Discovered, role not acknowledged yet.
    Registered,
    /// Role assignment acknowledged by the endpoint.
    Assigned,
    /// At least one count notification received.
    Counting,
    /// Reached the threshold first.
    Won,
    /// Another player won.
    Lost,
}

impl PlayerState {
    /// `Won` and `Lost` are terminal for a round.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlayerState::Won | PlayerState::Lost)
    }
}

/// Player info tracked during a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    /// Host the endpoint was discovered at.
    pub identity: PlayerIdentity,
    /// Assigned role, [`RoleId::OFF`] until the endpoint acknowledged it.
    pub role: RoleId,
    /// Last repetition count reported by the endpoint.
    pub count: u32,
    /// Progress through the current round.
    pub state: PlayerState,
}

impl Player {
    fn new(identity: PlayerIdentity) -> Self {
        Self {
            identity,
            role: RoleId::OFF,
            count: 0,
            state: PlayerState::Registered,
        }
    }
}

/// Result of recording a count notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountUpdate {
    /// Endpoint the count came from.
    pub identity: PlayerIdentity,
    /// Role held by that endpoint.
    pub role: RoleId,
    /// Recorded count.
    pub count: u32,
}

/// Players affected by a win declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinOutcome {
    /// Player that reached the threshold.
    pub winner: PlayerIdentity,
    /// Role held by the winner.
    pub role: RoleId,
    /// Every other player, in discovery order.
    pub losers: Vec<PlayerIdentity>,
}

/// Reasons a win declaration is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WinRejected {
    /// Another player already won this round.
    #[error("`{winner}` already won this round")]
    AlreadyDecided {
        /// Player that won first.
        winner: PlayerIdentity,
    },
    /// The identity is not part of the registry.
    #[error("unknown player `{0}`")]
    UnknownPlayer(PlayerIdentity),
}

/// In-memory collection of discovered players keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    players: IndexMap<PlayerIdentity, Player>,
}

impl Registry {
    /// Build a registry from discovered identities; every player starts `Registered`.
    pub fn from_identities(identities: IndexSet<PlayerIdentity>) -> Self {
        let players = identities
            .into_iter()
            .map(|identity| (identity.clone(), Player::new(identity)))
            .collect();
        Self { players }
    }

    /// Number of registered players.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Whether the directory listed nobody.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Player registered under `identity`.
    pub fn get(&self, identity: &str) -> Option<&Player> {
        self.players.get(identity)
    }

    /// Players in discovery order.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Identities in discovery order.
    pub fn identities(&self) -> Vec<PlayerIdentity> {
        self.players.keys().cloned().collect()
    }

    /// Find the player currently holding `role`.
    pub fn find_by_role(&self, role: RoleId) -> Option<&Player> {
        if !role.is_assigned() {
            return None;
        }
        self.players.values().find(|player| player.role == role)
    }

    /// Roles `1..=N` following discovery order.
    pub fn planned_roles(&self) -> Vec<(PlayerIdentity, RoleId)> {
        self.players
            .keys()
            .zip(1u16..)
            .map(|(identity, role)| (identity.clone(), RoleId(role)))
            .collect()
    }

    /// Record an acknowledged role assignment.
    pub fn mark_assigned(&mut self, identity: &str, role: RoleId) -> bool {
        let Some(player) = self.players.get_mut(identity) else {
            return false;
        };
        player.role = role;
        if player.state == PlayerState::Registered {
            player.state = PlayerState::Assigned;
        }
        true
    }

    /// Store a reported count, moving non-terminal players to `Counting`.
    pub fn record_count(&mut self, identity: &str, count: u32) -> Option<CountUpdate> {
        let player = self.players.get_mut(identity)?;
        player.count = count;
        if !player.state.is_terminal() {
            player.state = PlayerState::Counting;
        }
        Some(CountUpdate {
            identity: player.identity.clone(),
            role: player.role,
            count,
        })
    }

    /// The current winner, if any.
    pub fn winner(&self) -> Option<&Player> {
        self.players
            .values()
            .find(|player| player.state == PlayerState::Won)
    }

    /// Declare `identity` the winner and every other player a loser.
    ///
    /// The first declaration of a round wins; later ones are rejected.
    pub fn declare_winner(&mut self, identity: &str) -> Result<WinOutcome, WinRejected> {
        if let Some(winner) = self.winner() {
            return Err(WinRejected::AlreadyDecided {
                winner: winner.identity.clone(),
            });
        }
        let role = self
            .players
            .get(identity)
            .map(|player| player.role)
            .ok_or_else(|| WinRejected::UnknownPlayer(identity.to_owned()))?;

        let mut losers = Vec::with_capacity(self.players.len().saturating_sub(1));
        for player in self.players.values_mut() {
            if player.identity == identity {
                player.state = PlayerState::Won;
            } else {
                player.state = PlayerState::Lost;
                losers.push(player.identity.clone());
            }
        }

        Ok(WinOutcome {
            winner: identity.to_owned(),
            role,
            losers,
        })
    }

    /// Zero every count; with `clear_outcome`, also drop `Won`/`Lost` states.
    pub fn reset(&mut self, clear_outcome: bool) {
        for player in self.players.values_mut() {
            player.count = 0;
            if clear_outcome && player.state.is_terminal() {
                player.state = if player.role.is_assigned() {
                    PlayerState::Assigned
                } else {
                    PlayerState::Registered
                };
            }
        }
    }
}
