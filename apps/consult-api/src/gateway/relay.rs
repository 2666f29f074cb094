//! Signaling relay: join, forward negotiation messages, leave, disconnect.
//!
//! Identity comes from the gateway handshake and is trusted. Roles and room
//! tokens are always re-derived from the session record.

use std::sync::Arc;

use serde_json::Value;

use crate::directory::SessionDirectory;
use crate::error::SignalError;
use crate::models::session::SessionStatus;

use super::connections::ConnectionRegistry;
use super::events::{ClientEvent, ServerEvent, SignalKind};
use super::lifecycle::LifecycleCoordinator;
use super::rooms::{Departure, JoinOutcome, Participant, RoomRegistry};
use super::session::GatewaySession;

/// Room and connection state for every live call on this process.
pub struct SignalingRelay {
    directory: Arc<dyn SessionDirectory>,
    rooms: RoomRegistry,
    connections: ConnectionRegistry,
    lifecycle: LifecycleCoordinator,
}

impl SignalingRelay {
    pub fn new(directory: Arc<dyn SessionDirectory>) -> Self {
        Self {
            lifecycle: LifecycleCoordinator::new(directory.clone()),
            directory,
            rooms: RoomRegistry::new(),
            connections: ConnectionRegistry::new(),
        }
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Make a freshly identified connection known to the relay.
    pub fn register(&self, session: &GatewaySession) {
        self.connections
            .register_connection(&session.connection_id, &session.identity);
    }

    /// Dispatch a decoded client event.
    pub async fn handle(
        &self,
        session: &GatewaySession,
        event: ClientEvent,
    ) -> Result<(), SignalError> {
        match event {
            ClientEvent::JoinRoom(p) => {
                if p.identity.as_deref().is_some_and(|id| id != session.identity) {
                    return Err(SignalError::Unauthorized);
                }
                self.join(session, &p.session_id).await.map(|_| ())
            }
            ClientEvent::Signal { kind, signal } => self
                .relay(&session.connection_id, &signal.room_token, kind, signal.payload)
                .map(|_| ()),
            ClientEvent::LeaveRoom(p) => self
                .leave(&session.connection_id, &p.room_token)
                .await
                .map(|_| ()),
        }
    }

    /// Join the live room of `session_id`.
    ///
    /// The directory lookup happens before any room is touched, so a refused
    /// join never materializes a room.
    pub async fn join(
        &self,
        session: &GatewaySession,
        session_id: &str,
    ) -> Result<JoinOutcome, SignalError> {
        let record = self
            .directory
            .find_by_id(session_id)
            .await?
            .ok_or(SignalError::SessionNotFound)?;

        let role = record
            .role_of(&session.identity)
            .ok_or(SignalError::Unauthorized)?;

        let room_token = record
            .joinable_room()
            .ok_or(SignalError::SessionNotJoinable(record.status))?;

        let outcome = self.rooms.join(
            room_token,
            &record.id,
            Participant {
                connection_id: session.connection_id.clone(),
                identity: session.identity.clone(),
                role,
                outbound: session.outbound.clone(),
            },
            &self.connections,
        )?;

        // The session may have completed between the lookup and the room
        // insert. Any completion after this read will find the joiner in the
        // room and evict it.
        self.recheck_joinable(session, &record.id, room_token).await?;

        tracing::info!(
            connection_id = %session.connection_id,
            identity = %session.identity,
            session_id = %record.id,
            %room_token,
            ?role,
            peers = outcome.peers.len(),
            already_joined = outcome.already_joined,
            became_ready = outcome.became_ready,
            "joined call room"
        );

        Ok(outcome)
    }

    async fn recheck_joinable(
        &self,
        session: &GatewaySession,
        session_id: &str,
        room_token: &str,
    ) -> Result<(), SignalError> {
        let status = match self.directory.find_by_id(session_id).await {
            Ok(Some(record)) if record.joinable_room() == Some(room_token) => return Ok(()),
            Ok(Some(record)) => record.status,
            Ok(None) => {
                self.close_stale_room(session_id, room_token, None);
                return Err(SignalError::SessionNotFound);
            }
            Err(err) => {
                // Fail closed: undo this join only, others were admitted on
                // their own reads.
                if let Ok(departure) =
                    self.rooms
                        .leave(room_token, &session.connection_id, &self.connections)
                {
                    self.depart(&departure).await;
                }
                return Err(err.into());
            }
        };

        let farewell = (status == SessionStatus::Completed).then(|| ServerEvent::SessionCompleted {
            session_id: session_id.to_string(),
        });
        self.close_stale_room(session_id, room_token, farewell);
        Err(SignalError::SessionNotJoinable(status))
    }

    fn close_stale_room(&self, session_id: &str, room_token: &str, farewell: Option<ServerEvent>) {
        let evicted = self.rooms.close(room_token, &self.connections, farewell);
        tracing::warn!(
            %session_id,
            %room_token,
            evicted = evicted.len(),
            "session stopped being joinable during join; room closed"
        );
    }

    /// Forward an opaque negotiation payload to the other room members.
    /// Returns how many connections it was queued for.
    pub fn relay(
        &self,
        connection_id: &str,
        room_token: &str,
        kind: SignalKind,
        payload: Value,
    ) -> Result<usize, SignalError> {
        if !self.connections.is_member(connection_id, room_token) {
            return Err(if self.rooms.contains(room_token) {
                SignalError::NotAMember
            } else {
                SignalError::RoomNotFound
            });
        }
        let from = self
            .connections
            .identity_of(connection_id)
            .ok_or(SignalError::NotAMember)?;

        let delivered = self.rooms.forward(
            room_token,
            connection_id,
            ServerEvent::Signal {
                kind,
                room_token: room_token.to_string(),
                from,
                payload,
            },
        )?;

        tracing::trace!(%connection_id, %room_token, kind = kind.as_str(), delivered, "relayed signal");
        Ok(delivered)
    }

    /// Explicit departure from one room.
    pub async fn leave(
        &self,
        connection_id: &str,
        room_token: &str,
    ) -> Result<Departure, SignalError> {
        let departure = self.rooms.leave(room_token, connection_id, &self.connections)?;
        tracing::info!(
            %connection_id,
            identity = %departure.identity,
            %room_token,
            remaining = departure.remaining,
            "left call room"
        );
        self.depart(&departure).await;
        Ok(departure)
    }

    /// Transport-level disconnect. Leaves every joined room exactly once and
    /// never fails.
    pub async fn disconnect(&self, connection_id: &str) {
        let rooms = self.connections.drop_connection(connection_id);
        for room_token in rooms {
            match self.rooms.leave(&room_token, connection_id, &self.connections) {
                Ok(departure) => {
                    tracing::info!(
                        %connection_id,
                        identity = %departure.identity,
                        %room_token,
                        remaining = departure.remaining,
                        "disconnected from call room"
                    );
                    self.depart(&departure).await;
                }
                // Room was closed under us (session completed); nothing to do.
                Err(err) => {
                    tracing::debug!(%connection_id, %room_token, %err, "disconnect cleanup skipped");
                }
            }
        }
    }

    async fn depart(&self, departure: &Departure) {
        self.lifecycle
            .on_departure(departure, &self.rooms, &self.connections)
            .await;
    }
}
