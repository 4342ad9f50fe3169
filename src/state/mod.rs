mod events;
/// Players, roles and the registry.
pub mod player;
/// Session phase machine.
pub mod state_machine;
/// Phase transitions with announcement.
pub mod transitions;

use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexSet;
use tokio::sync::{RwLock, watch};

use crate::config::AppConfig;

pub use self::events::{EventHub, RefereeEvent};
pub use self::state_machine::InvalidTransition;
use self::{
    player::{PlayerIdentity, Registry},
    state_machine::{SessionEvent, SessionPhase, SessionStateMachine},
};

/// Shared handle to the session state.
pub type SharedState = Arc<AppState>;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle of the count subscription held for one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// Player known, no observation attempted yet.
    Idle,
    /// Registration sent, first response pending.
    Subscribing,
    /// Notifications are flowing.
    Active,
    /// Released by the referee or closed by the endpoint.
    Cancelled,
    /// Could not be established; the player is excluded from observation.
    Failed,
}

/// Central session state shared by the observation manager and the operator console.
pub struct AppState {
    config: Arc<AppConfig>,
    registry: RwLock<Registry>,
    session: RwLock<SessionStateMachine>,
    phase: watch::Sender<SessionPhase>,
    subscriptions: DashMap<PlayerIdentity, SubscriptionPhase>,
    events: EventHub,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The session starts discovering with an empty registry.
    pub fn new(config: AppConfig) -> SharedState {
        let (phase_tx, _rx) = watch::channel(SessionPhase::Discovering);
        Arc::new(Self {
            config: Arc::new(config),
            registry: RwLock::new(Registry::default()),
            session: RwLock::new(SessionStateMachine::new()),
            phase: phase_tx,
            subscriptions: DashMap::new(),
            events: EventHub::new(EVENT_CAPACITY),
        })
    }

    /// Immutable configuration for the session.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    /// Player registry guarded for concurrent readers and writers.
    pub fn registry(&self) -> &RwLock<Registry> {
        &self.registry
    }

    /// Replace the registry with freshly discovered players.
    pub async fn install_players(&self, identities: IndexSet<PlayerIdentity>) {
        let mut guard = self.registry.write().await;
        self.subscriptions.clear();
        for identity in &identities {
            self.subscriptions
                .insert(identity.clone(), SubscriptionPhase::Idle);
        }
        *guard = Registry::from_identities(identities);
    }

    /// Broadcast hub used for console announcements.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Per-player subscription lifecycle, keyed by identity.
    pub fn subscriptions(&self) -> &DashMap<PlayerIdentity, SubscriptionPhase> {
        &self.subscriptions
    }

    /// Phase of the subscription held for `identity`. `None` for an identity never installed.
    pub fn subscription_phase(&self, identity: &str) -> Option<SubscriptionPhase> {
        self.subscriptions.get(identity).map(|entry| *entry.value())
    }

    /// Current phase of the session state machine.
    pub async fn phase(&self) -> SessionPhase {
        self.session.read().await.phase()
    }

    /// Subscribe to phase changes.
    pub fn phase_watcher(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Apply `event` to the session state machine and publish the new phase to watchers.
    async fn apply_transition(
        &self,
        event: SessionEvent,
    ) -> Result<SessionPhase, InvalidTransition> {
        let mut sm = self.session.write().await;
        let next = sm.apply(event)?;
        self.phase.send_replace(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn installed_players_start_idle() {
        let state = AppState::new(AppConfig::default());
        state
            .subscriptions()
            .insert("stale".into(), SubscriptionPhase::Active);

        state
            .install_players(["h1".to_string(), "h2".to_string()].into_iter().collect())
            .await;

        assert_eq!(state.subscription_phase("h1"), Some(SubscriptionPhase::Idle));
        assert_eq!(state.subscription_phase("h2"), Some(SubscriptionPhase::Idle));
        assert_eq!(state.subscription_phase("stale"), None);
        assert_eq!(state.registry().read().await.len(), 2);
    }
}
