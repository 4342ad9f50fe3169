//! Library crate for the pushup referee, exposing modules for the binary and integration tests.

pub mod coap;
pub mod config;
/// Wire payloads: link-format listings and player commands.
pub mod dto;
/// Session level errors.
pub mod error;
/// Session flow, observation, console and player commands.
pub mod services;
/// Shared session state.
pub mod state;
