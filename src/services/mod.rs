use tokio::sync::watch;

/// Operator console reading commands and printing announcements.
pub mod console;
/// Resource directory discovery and player lookup.
pub mod discovery;
/// Role assignment and fire-and-forget player commands.
pub mod dispatcher;
/// Count subscriptions and win detection.
pub mod observation;
/// End-to-end referee session flow.
pub mod session;
/// Audio cue collaborator.
pub mod sound;

/// Resolve once `stop` reads `true`. Never resolves if the sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        futures::future::pending::<()>().await;
    }
}
