use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    coap::{CoapClient, TransportResult},
    config::RoleResource,
    dto::command::PlayerCommand,
    state::{SharedState, player::PlayerIdentity},
};

/// Outcome of sending the role plan to every player.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentReport {
    /// Players that acknowledged their role.
    pub assigned: Vec<PlayerIdentity>,
    /// Players left unassigned because the command failed.
    pub failed: Vec<PlayerIdentity>,
}

/// Send `command` to `host` and wait for the acknowledgement.
pub async fn send(
    client: &dyn CoapClient,
    host: &str,
    command: PlayerCommand,
    role_resource: RoleResource,
) -> TransportResult<()> {
    client
        .request(command.to_request(host, role_resource))
        .await
        .map(|_| ())
}

/// Send every player its planned role, one after the other.
///
/// A player whose assignment is not acknowledged stays `Registered` with role `0` and is
/// still observed.
pub async fn assign_roles(state: &SharedState, client: &dyn CoapClient) -> AssignmentReport {
    let role_resource = state.config().role_resource;
    let plan = state.registry().read().await.planned_roles();
    let mut report = AssignmentReport::default();

    for (identity, role) in plan {
        match send(client, &identity, PlayerCommand::AssignRole(role), role_resource).await {
            Ok(()) => {
                state.registry().write().await.mark_assigned(&identity, role);
                info!(host = %identity, role = %role, "role assigned");
                report.assigned.push(identity);
            }
            Err(err) => {
                warn!(
                    host = %identity,
                    role = %role,
                    error = %err,
                    "role assignment failed; player stays unassigned"
                );
                report.failed.push(identity);
            }
        }
    }

    report
}

/// Handles of a fire-and-forget broadcast.
///
/// Dropping this value detaches the deliveries; [`Broadcast::settled`] waits for them.
#[derive(Debug)]
pub struct Broadcast {
    handles: Vec<JoinHandle<()>>,
}

impl Broadcast {
    /// Number of deliveries started.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no delivery was started.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait until every delivery finished, successfully or not.
    pub async fn settled(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Fire `command` at every host concurrently without waiting for the acknowledgements.
///
/// Failures are logged and never retried.
pub fn broadcast(
    client: Arc<dyn CoapClient>,
    hosts: Vec<PlayerIdentity>,
    command: PlayerCommand,
    role_resource: RoleResource,
) -> Broadcast {
    let handles = hosts
        .into_iter()
        .map(|host| {
            let delivery = client.request(command.to_request(&host, role_resource));
            tokio::spawn(async move {
                match delivery.await {
                    Ok(_) => debug!(host = %host, command = ?command, "command delivered"),
                    Err(err) => {
                        warn!(
                            host = %host,
                            command = ?command,
                            error = %err,
                            "command delivery failed"
                        )
                    }
                }
            })
        })
        .collect();

    Broadcast { handles }
}
