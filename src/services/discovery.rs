use indexmap::IndexSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    coap::{CoapClient, Request, TransportError},
    config::DirectoryConfig,
    dto::link_format::parse_endpoints,
    error::ServiceError,
    state::player::PlayerIdentity,
};

const WELL_KNOWN_CORE: &str = "/.well-known/core";
const DIRECTORY_RESOURCE_TYPE: &str = "rt=core.rd*";

/// Find the resource directory with a non-confirmable multicast lookup.
///
/// Returns the host info of whoever answered first.
pub async fn locate_directory(
    client: &dyn CoapClient,
    config: &DirectoryConfig,
) -> Result<String, ServiceError> {
    let request = Request::get(config.multicast_address.clone(), WELL_KNOWN_CORE)
        .with_query(DIRECTORY_RESOURCE_TYPE)
        .non_confirmable();

    let outcome = match timeout(config.timeout, client.request(request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(TransportError::Timeout {
            host: config.multicast_address.clone(),
            path: WELL_KNOWN_CORE.into(),
        }),
    };

    match outcome {
        Ok(response) => {
            info!(directory = %response.source, "resource directory located");
            Ok(response.source)
        }
        Err(err) => {
            warn!(
                group = %config.multicast_address,
                error = %err,
                "resource directory discovery failed"
            );
            Err(ServiceError::DirectoryNotFound(err))
        }
    }
}

/// Ask the directory for every endpoint advertising the contest-player resource type.
///
/// An empty listing is not an error: the returned set is simply empty.
pub async fn lookup_players(
    client: &dyn CoapClient,
    directory: &str,
    config: &DirectoryConfig,
) -> Result<IndexSet<PlayerIdentity>, ServiceError> {
    let request = Request::get(directory, config.lookup_path.clone())
        .with_query(format!("rt={}", config.resource_type));

    let response = client.request(request).await.map_err(|err| {
        warn!(directory = %directory, error = %err, "player lookup failed");
        ServiceError::DirectoryLookup(err)
    })?;

    let payload = String::from_utf8_lossy(&response.payload);
    let players = parse_endpoints(&payload);
    if players.is_empty() {
        info!(directory = %directory, "no entries in resource directory");
    } else {
        info!(directory = %directory, count = players.len(), "players discovered");
    }
    Ok(players)
}
