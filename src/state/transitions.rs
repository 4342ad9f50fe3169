use tracing::debug;

use crate::{
    error::ServiceError,
    state::{
        RefereeEvent, SharedState,
        state_machine::{SessionEvent, SessionPhase},
    },
};

/// Apply a session transition, then broadcast the resulting phase change.
pub async fn apply_with_broadcast(
    state: &SharedState,
    event: SessionEvent,
) -> Result<SessionPhase, ServiceError> {
    let next = state.apply_transition(event).await?;
    debug!(event = ?event, phase = ?next, "session phase changed");
    state.events().broadcast(RefereeEvent::PhaseChanged(next));
    Ok(next)
}
