//! Pushup referee binary: wires configuration, the UDP CoAP transport, stdin and stdout.

use std::{
    io::{self, BufRead},
    sync::Arc,
    thread,
};

use anyhow::Context;
use pushup_referee::{
    coap::udp::UdpCoapClient,
    config::AppConfig,
    services::{session, sound::AssetCues},
    state::AppState,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const INPUT_BUFFER: usize = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let client = UdpCoapClient::new(config.request_timeout)
        .with_multicast_interface(config.directory.multicast_interface);
    let state = AppState::new(config);
    let sounds = Arc::new(AssetCues::new(state.config()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let report = session::run(
        state,
        Arc::new(client),
        sounds,
        stdin_lines(),
        tokio::io::stdout(),
        shutdown_rx,
    )
    .await
    .context("running referee session")?;

    info!(
        players = report.players,
        unassigned = report.assignment.failed.len(),
        outcome = ?report.outcome,
        "referee finished"
    );
    Ok(())
}

/// Configure tracing subscribers; `RUST_LOG` overrides the `info` default.
fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

/// Forward stdin lines from a blocking reader thread.
fn stdin_lines() -> ReceiverStream<String> {
    let (tx, rx) = mpsc::channel(INPUT_BUFFER);
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to read console input");
                    break;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}
