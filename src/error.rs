use std::io;

use thiserror::Error;

use crate::{coap::TransportError, state::InvalidTransition};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Nobody answered the multicast directory discovery.
    #[error("resource directory not found")]
    DirectoryNotFound(#[source] TransportError),
    /// The directory was found but the player lookup failed.
    #[error("resource directory lookup failed")]
    DirectoryLookup(#[source] TransportError),
    /// The directory lists no contest players.
    #[error("no players registered in the resource directory")]
    NoPlayers,
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Reading operator input or writing console output failed.
    #[error("console i/o failed")]
    Console(#[from] io::Error),
    /// A session task panicked or was aborted.
    #[error("session task failed: {0}")]
    Task(String),
}

impl From<InvalidTransition> for ServiceError {
    fn from(err: InvalidTransition) -> Self {
        ServiceError::InvalidState(err.to_string())
    }
}
