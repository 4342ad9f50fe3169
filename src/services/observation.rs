//! Count observation and win detection.
//!
//! One subscription per player feeds a single merged stream. The first player whose count
//! equals the win threshold wins the round; every subscription is released as soon as that
//! happens.

use std::sync::Arc;

use futures::{
    Stream, StreamExt,
    future::{self, join_all},
    stream::{self, select_all},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    coap::{CoapClient, Notification, Subscription},
    config::ResetPolicy,
    dto::command::{COUNT_PATH, PlayerCommand, decode_count},
    services::{dispatcher, sound::SoundCues, stopped},
    state::{
        RefereeEvent, SharedState, SubscriptionPhase,
        player::{PlayerIdentity, RoleId, WinOutcome},
        state_machine::{SessionEvent, SessionPhase},
        transitions::apply_with_broadcast,
    },
};

/// How an observation run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationOutcome {
    /// A player reached the threshold first.
    Winner {
        /// Winning endpoint.
        identity: PlayerIdentity,
        /// Role held by the winner.
        role: RoleId,
    },
    /// The stop signal fired.
    Stopped,
    /// No subscription could be established, or every one was closed by its endpoint.
    Exhausted,
}

enum Item {
    Notification(Notification),
    Closed(PlayerIdentity),
}

/// Observe every registered player until a winner is declared or `stop` fires.
///
/// Under [`ResetPolicy::ClearOutcome`] a decided round is followed by a new one once the
/// session is back to [`SessionPhase::Observing`].
pub async fn run(
    state: SharedState,
    client: Arc<dyn CoapClient>,
    sounds: Arc<dyn SoundCues>,
    mut stop: watch::Receiver<bool>,
) -> ObservationOutcome {
    let mut round = 1usize;
    loop {
        info!(round, "observation round started");
        let outcome = run_round(&state, &client, sounds.as_ref(), &mut stop).await;

        let rematch = matches!(outcome, ObservationOutcome::Winner { .. })
            && state.config().reset_policy == ResetPolicy::ClearOutcome;
        if !rematch || !next_round(&state, &mut stop).await {
            return outcome;
        }
        round += 1;
    }
}

async fn run_round(
    state: &SharedState,
    client: &Arc<dyn CoapClient>,
    sounds: &dyn SoundCues,
    stop: &mut watch::Receiver<bool>,
) -> ObservationOutcome {
    let subscriptions = subscribe_all(state, client.as_ref()).await;
    if subscriptions.is_empty() {
        warn!("no count subscription could be established");
        return ObservationOutcome::Exhausted;
    }

    let mut merged = select_all(subscriptions.into_iter().map(tagged));
    loop {
        let next = tokio::select! {
            biased;
            _ = stopped(stop) => None,
            item = merged.next() => Some(item),
        };

        let Some(item) = next else {
            drop(merged);
            mark_cancelled(state);
            info!("observation stopped");
            return ObservationOutcome::Stopped;
        };

        match item {
            None => {
                info!("every count subscription closed");
                return ObservationOutcome::Exhausted;
            }
            Some(Item::Closed(identity)) => {
                info!(host = %identity, "count subscription closed by endpoint");
                state
                    .subscriptions()
                    .insert(identity, SubscriptionPhase::Cancelled);
            }
            Some(Item::Notification(notification)) => {
                let decided = handle_notification(state, client, sounds, notification).await;
                if let Some(outcome) = decided {
                    drop(merged);
                    mark_cancelled(state);
                    return ObservationOutcome::Winner {
                        identity: outcome.winner,
                        role: outcome.role,
                    };
                }
            }
        }
    }
}

/// Open one `/count` observation per registered player, concurrently.
///
/// Players whose observation cannot be established are marked `Failed` and left out.
async fn subscribe_all(state: &SharedState, client: &dyn CoapClient) -> Vec<Subscription> {
    let identities = state.registry().read().await.identities();
    for identity in &identities {
        state
            .subscriptions()
            .insert(identity.clone(), SubscriptionPhase::Subscribing);
    }

    let attempts = join_all(identities.into_iter().map(|identity| {
        let attempt = client.observe(&identity, COUNT_PATH);
        async move { (identity, attempt.await) }
    }))
    .await;

    let mut live = Vec::with_capacity(attempts.len());
    for (identity, attempt) in attempts {
        match attempt {
            Ok(subscription) => {
                debug!(host = %identity, "count subscription active");
                state
                    .subscriptions()
                    .insert(identity, SubscriptionPhase::Active);
                live.push(subscription);
            }
            Err(err) => {
                warn!(
                    host = %identity,
                    error = %err,
                    "count subscription failed; player excluded"
                );
                state
                    .subscriptions()
                    .insert(identity, SubscriptionPhase::Failed);
            }
        }
    }
    live
}

fn tagged(subscription: Subscription) -> impl Stream<Item = Item> + Send + Unpin {
    let identity = subscription.host().to_owned();
    subscription
        .map(Item::Notification)
        .chain(stream::once(future::ready(Item::Closed(identity))))
}

/// Apply one notification. Returns the outcome when it decided the round.
async fn handle_notification(
    state: &SharedState,
    client: &Arc<dyn CoapClient>,
    sounds: &dyn SoundCues,
    notification: Notification,
) -> Option<WinOutcome> {
    let count = match decode_count(&notification.payload) {
        Ok(count) => count,
        Err(err) => {
            warn!(host = %notification.source, error = %err, "ignoring undecodable count");
            return None;
        }
    };

    let config = state.config();
    let (update, win) = {
        let mut registry = state.registry().write().await;
        let Some(update) = registry.record_count(&notification.source, count) else {
            debug!(host = %notification.source, "notification from unknown endpoint");
            return None;
        };
        let win = if count == config.win_threshold {
            registry
                .declare_winner(&update.identity)
                .inspect_err(|rejected| {
                    info!(
                        host = %update.identity,
                        reason = %rejected,
                        "threshold reached after the round was decided"
                    );
                })
                .ok()
        } else {
            None
        };
        (update, win)
    };

    let Some(outcome) = win else {
        debug!(host = %update.identity, role = %update.role, count, "count updated");
        state.events().broadcast(RefereeEvent::CountUpdated {
            identity: update.identity,
            role: update.role,
            count,
        });
        sounds.on_count_update(update.role);
        return None;
    };

    info!(
        host = %outcome.winner,
        role = %config.role_name(outcome.role),
        "winner declared"
    );
    state.events().broadcast(RefereeEvent::WinnerDeclared {
        identity: outcome.winner.clone(),
        role: outcome.role,
    });
    dispatcher::broadcast(
        client.clone(),
        vec![outcome.winner.clone()],
        PlayerCommand::SetWinner,
        config.role_resource,
    );
    dispatcher::broadcast(
        client.clone(),
        outcome.losers.clone(),
        PlayerCommand::SetLoser,
        config.role_resource,
    );
    sounds.on_win(outcome.role);
    if let Err(err) = apply_with_broadcast(state, SessionEvent::WinnerDeclared).await {
        warn!(error = %err, "could not finish the session");
    }

    Some(outcome)
}

/// Wait for a reset to bring the session back to observing. `false` when stopped first.
async fn next_round(state: &SharedState, stop: &mut watch::Receiver<bool>) -> bool {
    let mut phase = state.phase_watcher();
    info!("round decided; waiting for a reset");
    tokio::select! {
        biased;
        _ = stopped(stop) => false,
        observing = phase.wait_for(|phase| *phase == SessionPhase::Observing) => {
            observing.is_ok()
        }
    }
}

fn mark_cancelled(state: &SharedState) {
    for mut entry in state.subscriptions().iter_mut() {
        if matches!(
            *entry.value(),
            SubscriptionPhase::Subscribing | SubscriptionPhase::Active
        ) {
            *entry.value_mut() = SubscriptionPhase::Cancelled;
        }
    }
}
