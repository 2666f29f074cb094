//! Gateway opcodes, event types, and wire-format messages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalError;
use crate::models::session::ParticipantRole;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a DISPATCH message carrying a signaling event.
    pub fn event(seq: u64, event: &ServerEvent) -> Self {
        Self::dispatch(event.name(), seq, event.data())
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub ticket: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Signaling events (client → server)
// ---------------------------------------------------------------------------

/// Negotiation message kinds the relay forwards without inspecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => EventName::OFFER,
            Self::Answer => EventName::ANSWER,
            Self::Candidate => EventName::CANDIDATE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub session_id: String,
    /// Optional echo of the caller's identity. Must match the ticket's.
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub room_token: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomPayload {
    pub room_token: String,
}

/// A decoded client event. Everything past the gateway works with this type.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    JoinRoom(JoinRoomPayload),
    Signal { kind: SignalKind, signal: SignalPayload },
    LeaveRoom(LeaveRoomPayload),
}

fn decode_payload<T: DeserializeOwned>(name: &str, data: Value) -> Result<T, SignalError> {
    serde_json::from_value(data)
        .map_err(|e| SignalError::BadRequest(format!("invalid {name} payload: {e}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), SignalError> {
    if value.trim().is_empty() {
        return Err(SignalError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

impl ClientEvent {
    /// Decode a DISPATCH frame's `t`/`d` into a typed event.
    pub fn decode(name: &str, data: Value) -> Result<Self, SignalError> {
        let kind = match name {
            EventName::JOIN_ROOM => {
                let p: JoinRoomPayload = decode_payload(name, data)?;
                require_non_empty("sessionId", &p.session_id)?;
                return Ok(Self::JoinRoom(p));
            }
            EventName::LEAVE_ROOM => {
                let p: LeaveRoomPayload = decode_payload(name, data)?;
                require_non_empty("roomToken", &p.room_token)?;
                return Ok(Self::LeaveRoom(p));
            }
            EventName::OFFER => SignalKind::Offer,
            EventName::ANSWER => SignalKind::Answer,
            // Older clients still send the browser API's name.
            EventName::CANDIDATE | "ice-candidate" => SignalKind::Candidate,
            other => return Err(SignalError::BadRequest(format!("unknown event {other:?}"))),
        };

        let signal: SignalPayload = decode_payload(name, data)?;
        require_non_empty("roomToken", &signal.room_token)?;
        Ok(Self::Signal { kind, signal })
    }
}

// ---------------------------------------------------------------------------
// Signaling events (server → client)
// ---------------------------------------------------------------------------

/// Events pushed to a connection, either directly or via its room.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    JoinedRoom {
        session_id: String,
        room_token: String,
        role: ParticipantRole,
        peers: Vec<String>,
    },
    PeerJoined {
        identity: String,
    },
    RoomReady {
        room_token: String,
    },
    PeerLeft {
        identity: String,
    },
    Signal {
        kind: SignalKind,
        room_token: String,
        from: String,
        payload: Value,
    },
    SessionCompleted {
        session_id: String,
    },
    Error(SignalError),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinedRoom { .. } => EventName::JOINED_ROOM,
            Self::PeerJoined { .. } => EventName::PEER_JOINED,
            Self::RoomReady { .. } => EventName::ROOM_READY,
            Self::PeerLeft { .. } => EventName::PEER_LEFT,
            Self::Signal { kind, .. } => kind.as_str(),
            Self::SessionCompleted { .. } => EventName::SESSION_COMPLETED,
            Self::Error(_) => EventName::ERROR,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            Self::JoinedRoom {
                session_id,
                room_token,
                role,
                peers,
            } => serde_json::json!({
                "sessionId": session_id,
                "roomToken": room_token,
                "role": role,
                "peers": peers,
            }),
            Self::PeerJoined { identity } | Self::PeerLeft { identity } => {
                serde_json::json!({ "identity": identity })
            }
            Self::RoomReady { room_token } => serde_json::json!({ "roomToken": room_token }),
            Self::Signal {
                room_token,
                from,
                payload,
                ..
            } => serde_json::json!({
                "roomToken": room_token,
                "from": from,
                "payload": payload,
            }),
            Self::SessionCompleted { session_id } => {
                serde_json::json!({ "sessionId": session_id })
            }
            Self::Error(err) => serde_json::json!({
                "code": err.code(),
                "message": err.to_string(),
                "retryable": err.retryable(),
            }),
        }
    }
}

/// Event names used in DISPATCH frames.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const JOIN_ROOM: &'static str = "join-room";
    pub const JOINED_ROOM: &'static str = "joined-room";
    pub const LEAVE_ROOM: &'static str = "leave-room";
    pub const PEER_JOINED: &'static str = "peer-joined";
    pub const PEER_LEFT: &'static str = "peer-left";
    pub const ROOM_READY: &'static str = "room-ready";
    pub const OFFER: &'static str = "offer";
    pub const ANSWER: &'static str = "answer";
    pub const CANDIDATE: &'static str = "candidate";
    pub const SESSION_COMPLETED: &'static str = "session-completed";
    pub const ERROR: &'static str = "error";
}
