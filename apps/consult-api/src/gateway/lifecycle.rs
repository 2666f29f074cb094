//! Decides when a departure ends the consultation and completes it.
//!
//! The consultation completes when the responder (expert) is no longer in the
//! room on any device, or when the room empties. A requester leaving while the
//! responder is still connected changes nothing.

use std::sync::Arc;

use crate::directory::{CompletionOutcome, SessionDirectory};
use crate::models::session::ParticipantRole;

use super::connections::ConnectionRegistry;
use super::events::ServerEvent;
use super::rooms::{Departure, RoomRegistry};

/// Whether `departure` should complete the session.
pub fn ends_session(departure: &Departure) -> bool {
    let responder_gone =
        departure.role == ParticipantRole::Responder && !departure.identity_still_present;
    departure.room_emptied() || responder_gone
}

pub struct LifecycleCoordinator {
    directory: Arc<dyn SessionDirectory>,
}

impl LifecycleCoordinator {
    pub fn new(directory: Arc<dyn SessionDirectory>) -> Self {
        Self { directory }
    }

    /// React to a participant leaving a room.
    ///
    /// Makes at most one directory call per departure. Must be called with no
    /// room guard held. Failures are logged and swallowed: the participant is
    /// already gone and there is nobody to report to.
    pub async fn on_departure(
        &self,
        departure: &Departure,
        rooms: &RoomRegistry,
        index: &ConnectionRegistry,
    ) -> Option<CompletionOutcome> {
        if !ends_session(departure) {
            return None;
        }

        let outcome = match self.directory.mark_completed(&departure.session_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    session_id = %departure.session_id,
                    room_token = %departure.room_token,
                    %err,
                    "failed to complete session; leaving it CONFIRMED"
                );
                return None;
            }
        };

        match outcome {
            CompletionOutcome::Completed | CompletionOutcome::AlreadyCompleted => {
                if outcome.is_already_completed() {
                    tracing::debug!(
                        session_id = %departure.session_id,
                        room_token = %departure.room_token,
                        "session already completed; closing room"
                    );
                } else {
                    tracing::info!(
                        session_id = %departure.session_id,
                        room_token = %departure.room_token,
                        departed = %departure.identity,
                        "session completed"
                    );
                }
                // Anyone still in the room (or who raced in after an earlier
                // completion) is told and evicted.
                rooms.close(
                    &departure.room_token,
                    index,
                    Some(ServerEvent::SessionCompleted {
                        session_id: departure.session_id.clone(),
                    }),
                );
            }
            CompletionOutcome::NotCompletable(status) => {
                tracing::warn!(
                    session_id = %departure.session_id,
                    %status,
                    "session left call in a non-confirmed state; not completing"
                );
            }
            CompletionOutcome::NotFound => {
                tracing::warn!(session_id = %departure.session_id, "session vanished before completion");
            }
        }

        Some(outcome)
    }
}
