//! Referee session: discovery, role assignment, then observation alongside the console.

use std::sync::Arc;

use futures::Stream;
use tokio::{io::AsyncWrite, sync::watch, task::JoinError};
use tracing::{info, warn};

use crate::{
    coap::CoapClient,
    error::ServiceError,
    services::{
        console,
        discovery::{locate_directory, lookup_players},
        dispatcher::{self, AssignmentReport},
        observation::{self, ObservationOutcome},
        sound::SoundCues,
        stopped,
    },
    state::{SharedState, state_machine::SessionEvent, transitions::apply_with_broadcast},
};

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Number of players found in the directory.
    pub players: usize,
    /// Which players acknowledged their role.
    pub assignment: AssignmentReport,
    /// How the observation ended.
    pub outcome: ObservationOutcome,
}

/// Run one referee session end to end.
///
/// Discovery failures and an empty directory abort before any role is assigned. Afterwards the
/// observation and the console run until the console is done, `shutdown` fires, or no player is
/// left to observe. In every case the observation is stopped and its subscriptions released
/// before returning.
pub async fn run<I, W>(
    state: SharedState,
    client: Arc<dyn CoapClient>,
    sounds: Arc<dyn SoundCues>,
    input: I,
    output: W,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SessionReport, ServiceError>
where
    I: Stream<Item = String> + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let config = state.config();

    let directory = locate_directory(client.as_ref(), &config.directory).await?;
    let players = lookup_players(client.as_ref(), &directory, &config.directory).await?;
    if players.is_empty() {
        warn!(directory = %directory, "no players to referee");
        return Err(ServiceError::NoPlayers);
    }
    let player_count = players.len();
    state.install_players(players).await;
    apply_with_broadcast(&state, SessionEvent::PlayersDiscovered).await?;

    let assignment = dispatcher::assign_roles(&state, client.as_ref()).await;
    apply_with_broadcast(&state, SessionEvent::RolesAssigned).await?;
    info!(
        players = player_count,
        assigned = assignment.assigned.len(),
        failed = assignment.failed.len(),
        "roles assigned; observing"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut observation = tokio::spawn(observation::run(
        state.clone(),
        client.clone(),
        sounds,
        stop_rx.clone(),
    ));
    let mut console = tokio::spawn(console::run(state.clone(), client, input, output, stop_rx));

    let mut outcome = None;
    let mut console_done = None;
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => {
                info!("shutdown requested");
                break;
            }
            joined = &mut console => {
                console_done = Some(joined);
                break;
            }
            finished = &mut observation, if outcome.is_none() => {
                let ended = match &finished {
                    Ok(ObservationOutcome::Exhausted) => {
                        warn!("no player left to observe; ending session");
                        true
                    }
                    Ok(_) => false,
                    Err(_) => true,
                };
                outcome = Some(finished);
                if ended {
                    break;
                }
            }
        }
    }
    stop_tx.send_replace(true);

    let outcome = match outcome {
        Some(joined) => joined,
        None => observation.await,
    };
    let console_done = match console_done {
        Some(joined) => joined,
        None => console.await,
    };
    let outcome = outcome.map_err(task_failed)?;
    console_done.map_err(task_failed)??;

    info!(outcome = ?outcome, "session over");
    Ok(SessionReport {
        players: player_count,
        assignment,
        outcome,
    })
}

fn task_failed(err: JoinError) -> ServiceError {
    ServiceError::Task(err.to_string())
}
