//! Outbound player commands and the count payload carried by notifications.

use std::num::ParseIntError;

use thiserror::Error;

use crate::{
    coap::Request,
    config::RoleResource,
    state::player::RoleId,
};

/// Resource the player firmware exposes its count on.
pub const COUNT_PATH: &str = "/count";

/// Commands the referee sends to player endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    /// Tell the endpoint which role (color / id) it plays.
    AssignRole(RoleId),
    /// Start counting.
    Start,
    /// Zero the endpoint's count.
    Reset,
    /// The endpoint won the round.
    SetWinner,
    /// Another endpoint won the round.
    SetLoser,
    /// Firmware test hook that simulates one repetition.
    FakeRepetition,
}

impl PlayerCommand {
    /// Resource path for this command.
    pub fn path(self, role_resource: RoleResource) -> &'static str {
        match self {
            PlayerCommand::AssignRole(_) => role_resource.path(),
            PlayerCommand::Start => "/start",
            PlayerCommand::Reset => "/reset",
            PlayerCommand::SetWinner => "/set_to_winner",
            PlayerCommand::SetLoser => "/set_to_looser",
            PlayerCommand::FakeRepetition => "/fake_pushup",
        }
    }

    /// ASCII payload; only role assignment carries one.
    pub fn payload(self) -> Vec<u8> {
        match self {
            PlayerCommand::AssignRole(role) => role.0.to_string().into_bytes(),
            _ => Vec::new(),
        }
    }

    /// Build the request addressed to `host`.
    pub fn to_request(self, host: &str, role_resource: RoleResource) -> Request {
        let path = self.path(role_resource);
        match self {
            PlayerCommand::AssignRole(_) => Request::put(host, path, self.payload()),
            _ => Request::post(host, path),
        }
    }
}

/// Notification payload that is not an ASCII decimal count.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CountDecodeError {
    /// The payload bytes are not UTF-8.
    #[error("count payload is not valid UTF-8")]
    NotUtf8,
    /// The payload text is not an unsigned decimal.
    #[error("count payload `{payload}` is not a decimal number")]
    NotDecimal {
        /// Trimmed payload text.
        payload: String,
        /// Integer parse failure.
        #[source]
        source: ParseIntError,
    },
}

/// Decode the ASCII-decimal count carried by a `/count` notification.
pub fn decode_count(payload: &[u8]) -> Result<u32, CountDecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| CountDecodeError::NotUtf8)?;
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    trimmed
        .parse::<u32>()
        .map_err(|source| CountDecodeError::NotDecimal {
            payload: trimmed.to_owned(),
            source,
        })
}
