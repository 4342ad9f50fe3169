//! Operator console: line commands in, announcements out.

use std::{str::FromStr, sync::Arc};

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{broadcast::error::RecvError, watch},
};
use tracing::{debug, info, warn};

use crate::{
    coap::CoapClient,
    config::{AppConfig, ResetPolicy},
    dto::command::PlayerCommand,
    error::ServiceError,
    services::{dispatcher, stopped},
    state::{
        RefereeEvent, SharedState, SubscriptionPhase,
        player::RoleId,
        state_machine::{SessionEvent, SessionPhase},
        transitions::apply_with_broadcast,
    },
};

const HELP: &str = "Available commands: help | list | stats | start | reset | fake ROLE";

/// Commands understood by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Print the command summary.
    Help,
    /// Print every player with its role and subscription phase.
    List,
    /// Print the count of every player.
    Stats,
    /// Tell every player to start.
    Start,
    /// Zero every count and tell every player to reset.
    Reset,
    /// Trigger one simulated repetition on the player holding the role.
    Fake(RoleId),
}

/// Input line that is not a console command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized command `{0}`")]
pub struct UnknownCommand(pub String);

impl FromStr for ConsoleCommand {
    type Err = UnknownCommand;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = match (words.next(), words.next(), words.next()) {
            (Some("help"), None, _) => ConsoleCommand::Help,
            (Some("list"), None, _) => ConsoleCommand::List,
            (Some("stats"), None, _) => ConsoleCommand::Stats,
            (Some("start"), None, _) => ConsoleCommand::Start,
            (Some("reset"), None, _) => ConsoleCommand::Reset,
            (Some("fake"), Some(role), None) => role
                .parse()
                .map(|role| ConsoleCommand::Fake(RoleId(role)))
                .map_err(|_| UnknownCommand(line.trim().to_owned()))?,
            _ => return Err(UnknownCommand(line.trim().to_owned())),
        };
        Ok(command)
    }
}

/// Serve operator commands from `input` and print announcements to `output`.
///
/// Once `input` is exhausted the console keeps announcing until the session is finished.
/// Returns the writer when done.
pub async fn run<I, W>(
    state: SharedState,
    client: Arc<dyn CoapClient>,
    mut input: I,
    mut output: W,
    mut stop: watch::Receiver<bool>,
) -> Result<W, ServiceError>
where
    I: Stream<Item = String> + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let config = state.config();
    let mut events = state.events().subscribe();
    let mut phase = state.phase_watcher();
    let mut input_open = true;

    loop {
        if !input_open && *phase.borrow_and_update() == SessionPhase::Finished {
            while let Ok(event) = events.try_recv() {
                announce(&config, &mut output, event).await?;
            }
            debug!("console input closed and session finished");
            return Ok(output);
        }

        tokio::select! {
            biased;
            _ = stopped(&mut stop) => {
                debug!("console stopped");
                return Ok(output);
            }
            event = events.recv() => match event {
                Ok(event) => announce(&config, &mut output, event).await?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console missed announcements"),
                Err(RecvError::Closed) => return Ok(output),
            },
            line = input.next(), if input_open => match line {
                Some(line) => match line.parse::<ConsoleCommand>() {
                    Ok(command) => execute(&state, &client, &mut output, command).await?,
                    Err(err) if line.trim().is_empty() => {
                        debug!(error = %err, "empty console line")
                    }
                    Err(err) => debug!(error = %err, "ignoring console input"),
                },
                None => {
                    info!("console input closed");
                    input_open = false;
                }
            },
            changed = phase.changed(), if !input_open => {
                if changed.is_err() {
                    return Ok(output);
                }
            }
        }
    }
}

async fn execute<W>(
    state: &SharedState,
    client: &Arc<dyn CoapClient>,
    output: &mut W,
    command: ConsoleCommand,
) -> Result<(), ServiceError>
where
    W: AsyncWrite + Unpin + Send,
{
    let config = state.config();
    debug!(command = ?command, "console command");

    match command {
        ConsoleCommand::Help => write_line(output, HELP).await?,
        ConsoleCommand::List => {
            let lines: Vec<String> = {
                let registry = state.registry().read().await;
                registry
                    .players()
                    .map(|player| {
                        format!(
                            "{} ({}) [{}]",
                            config.role_name(player.role),
                            player.identity,
                            phase_label(
                                state
                                    .subscription_phase(&player.identity)
                                    .unwrap_or(SubscriptionPhase::Idle)
                            )
                        )
                    })
                    .collect()
            };
            write_line(output, "Available players:").await?;
            for line in lines {
                write_line(output, &line).await?;
            }
        }
        ConsoleCommand::Stats => {
            let lines: Vec<String> = state
                .registry()
                .read()
                .await
                .players()
                .map(|player| format!("{}: {}", config.role_name(player.role), player.count))
                .collect();
            for line in lines {
                write_line(output, &line).await?;
            }
        }
        ConsoleCommand::Start => {
            let hosts = state.registry().read().await.identities();
            dispatcher::broadcast(
                client.clone(),
                hosts,
                PlayerCommand::Start,
                config.role_resource,
            );
            write_line(output, "Game started.").await?;
        }
        ConsoleCommand::Reset => reset(state, client, &config).await?,
        ConsoleCommand::Fake(role) => {
            let host = state
                .registry()
                .read()
                .await
                .find_by_role(role)
                .map(|player| player.identity.clone());
            match host {
                Some(host) => {
                    dispatcher::broadcast(
                        client.clone(),
                        vec![host],
                        PlayerCommand::FakeRepetition,
                        config.role_resource,
                    );
                }
                None => write_line(output, &format!("No player with role {role}.")).await?,
            }
        }
    }
    Ok(())
}

/// Zero every count and tell every endpoint to reset.
///
/// Under [`ResetPolicy::ClearOutcome`] the round outcome is cleared too and the session goes
/// back to observing.
async fn reset(
    state: &SharedState,
    client: &Arc<dyn CoapClient>,
    config: &AppConfig,
) -> Result<(), ServiceError> {
    let clear_outcome = config.reset_policy == ResetPolicy::ClearOutcome;
    let hosts = {
        let mut registry = state.registry().write().await;
        registry.reset(clear_outcome);
        registry.identities()
    };
    dispatcher::broadcast(client.clone(), hosts, PlayerCommand::Reset, config.role_resource);

    if clear_outcome {
        apply_with_broadcast(state, SessionEvent::Reset).await?;
    }
    state.events().broadcast(RefereeEvent::PlayersReset);
    info!(cleared_outcome = clear_outcome, "players reset");
    Ok(())
}

async fn announce<W>(
    config: &AppConfig,
    output: &mut W,
    event: RefereeEvent,
) -> Result<(), ServiceError>
where
    W: AsyncWrite + Unpin + Send,
{
    match event {
        RefereeEvent::CountUpdated { role, count, .. } => {
            write_line(output, &format!("{} pushup count: {count}", config.role_name(role))).await
        }
        RefereeEvent::WinnerDeclared { identity, role } => {
            write_line(
                output,
                &format!("The winner is: {} {identity}", config.role_name(role)),
            )
            .await
        }
        RefereeEvent::PlayersReset => write_line(output, "Players have been reset.").await,
        // Only a reset re-enters observing while the console runs.
        RefereeEvent::PhaseChanged(SessionPhase::Observing) => {
            write_line(output, "New round started.").await
        }
        RefereeEvent::PhaseChanged(_) => Ok(()),
    }
}

fn phase_label(phase: SubscriptionPhase) -> &'static str {
    match phase {
        SubscriptionPhase::Idle => "idle",
        SubscriptionPhase::Subscribing => "subscribing",
        SubscriptionPhase::Active => "active",
        SubscriptionPhase::Cancelled => "cancelled",
        SubscriptionPhase::Failed => "failed",
    }
}

async fn write_line<W>(output: &mut W, line: &str) -> Result<(), ServiceError>
where
    W: AsyncWrite + Unpin + Send,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
