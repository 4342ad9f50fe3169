use std::{sync::Arc, time::Duration};

use pushup_referee::{
    coap::memory::MemoryCoapClient,
    config::AppConfig,
    error::ServiceError,
    services::{
        observation::ObservationOutcome,
        session::{self, SessionReport},
        sound::AssetCues,
    },
    state::{
        AppState, SharedState, SubscriptionPhase,
        player::{PlayerState, RoleId},
        state_machine::SessionPhase,
    },
};
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;

const DIRECTORY: &str = "[2001:db8::100]";
const TWO_PLAYERS: &str = r#"<coap://h1/x>;rt="pushups_player",<coap://h2/x>;rt="pushups_player""#;

struct Harness {
    client: MemoryCoapClient,
    state: SharedState,
    input: mpsc::Sender<String>,
    console: DuplexStream,
    shutdown: watch::Sender<bool>,
    session: JoinHandle<Result<SessionReport, ServiceError>>,
}

fn directory(listing: &str) -> MemoryCoapClient {
    let client = MemoryCoapClient::new();
    client.respond_from("[ff02::1]", "/.well-known/core", DIRECTORY, "</rd>;rt=core.rd");
    client.respond(DIRECTORY, "/endpoint-lookup/", listing);
    client
}

fn start(config: AppConfig, listing: &str) -> Harness {
    start_with(directory(listing), config)
}

fn start_with(client: MemoryCoapClient, config: AppConfig) -> Harness {
    let state = AppState::new(config);
    let (input, input_rx) = mpsc::channel(8);
    let (writer, console) = tokio::io::duplex(64 * 1024);
    let (shutdown, shutdown_rx) = watch::channel(false);

    let session = tokio::spawn(session::run(
        state.clone(),
        Arc::new(client.clone()),
        Arc::new(AssetCues::new(state.config())),
        ReceiverStream::new(input_rx),
        writer,
        shutdown_rx,
    ));

    Harness {
        client,
        state,
        input,
        console,
        shutdown,
        session,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn first_player_to_reach_the_threshold_wins() {
    let Harness {
        client,
        state,
        input,
        mut console,
        shutdown: _shutdown,
        session,
    } = start(AppConfig::default().with_win_threshold(10), TWO_PLAYERS);

    eventually(|| client.is_observed("h1") && client.is_observed("h2")).await;
    {
        let registry = state.registry().read().await;
        assert_eq!(registry.get("h1").unwrap().role, RoleId(1));
        assert_eq!(registry.get("h2").unwrap().role, RoleId(2));
    }
    assert_eq!(
        client.hosts_requested("/assign_color"),
        vec!["h1", "h2"]
    );

    input.send("list".into()).await.unwrap();
    let listing = "Available players:\nRED (h1) [active]\nGREEN (h2) [active]\n";
    let mut printed = vec![0u8; listing.len()];
    console.read_exact(&mut printed).await.unwrap();
    assert_eq!(String::from_utf8(printed).unwrap(), listing);
    drop(input);

    assert!(client.notify("h2", "4").await);
    eventually(|| {
        state
            .registry()
            .try_read()
            .map(|registry| registry.get("h2").unwrap().count == 4)
            .unwrap_or(false)
    })
    .await;
    assert!(client.notify("h1", "10").await);

    let report = session.await.unwrap().unwrap();
    assert_eq!(report.players, 2);
    assert_eq!(report.assignment.assigned.len(), 2);
    assert_eq!(
        report.outcome,
        ObservationOutcome::Winner {
            identity: "h1".into(),
            role: RoleId(1)
        }
    );

    let registry = state.registry().read().await;
    assert_eq!(registry.get("h1").unwrap().state, PlayerState::Won);
    assert_eq!(registry.get("h2").unwrap().state, PlayerState::Lost);
    assert_eq!(registry.get("h2").unwrap().count, 4);
    drop(registry);

    assert_eq!(client.hosts_requested("/set_to_winner"), vec!["h1"]);
    assert_eq!(client.hosts_requested("/set_to_looser"), vec!["h2"]);
    let mut released = client.released();
    released.sort();
    assert_eq!(released, vec!["h1", "h2"]);
    assert_eq!(state.phase().await, SessionPhase::Finished);
    assert_eq!(
        state.subscription_phase("h2"),
        Some(SubscriptionPhase::Cancelled)
    );

    let mut transcript = String::new();
    console.read_to_string(&mut transcript).await.unwrap();
    assert_eq!(
        transcript,
        "GREEN pushup count: 4\nThe winner is: RED h1\n"
    );
}

#[tokio::test]
async fn empty_directory_aborts_before_assignment() {
    let harness = start(AppConfig::default(), "");

    let err = harness.session.await.unwrap().unwrap_err();
    assert!(matches!(err, ServiceError::NoPlayers));

    let paths: Vec<String> = harness
        .client
        .requests()
        .into_iter()
        .map(|request| request.path)
        .collect();
    assert_eq!(paths, vec!["/.well-known/core", "/endpoint-lookup/"]);
    assert!(harness.client.released().is_empty());
    assert_eq!(harness.state.phase().await, SessionPhase::Discovering);
}

#[tokio::test]
async fn shutdown_releases_subscriptions() {
    let harness = start(AppConfig::default(), TWO_PLAYERS);

    eventually(|| harness.client.is_observed("h1") && harness.client.is_observed("h2")).await;
    harness.shutdown.send(true).unwrap();

    let report = harness.session.await.unwrap().unwrap();
    assert_eq!(report.outcome, ObservationOutcome::Stopped);
    assert_eq!(harness.client.released().len(), 2);
    assert!(harness.client.hosts_requested("/set_to_looser").is_empty());
    drop(harness.input);
}

#[tokio::test]
async fn session_ends_when_no_player_can_be_observed() {
    let client = directory(TWO_PLAYERS);
    client.refuse_observe("h1");
    client.refuse_observe("h2");
    let harness = start_with(client, AppConfig::default());
    drop(harness.input);

    let report = tokio::time::timeout(Duration::from_secs(2), harness.session)
        .await
        .expect("session should end without operator input")
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome, ObservationOutcome::Exhausted);
    assert_eq!(report.assignment.assigned.len(), 2);
    assert_eq!(
        harness.state.subscription_phase("h1"),
        Some(SubscriptionPhase::Failed)
    );
    assert_eq!(
        harness.state.subscription_phase("h2"),
        Some(SubscriptionPhase::Failed)
    );
    assert_eq!(harness.state.phase().await, SessionPhase::Observing);
    assert!(harness.client.released().is_empty());
}
