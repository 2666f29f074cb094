use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::db::schema::consultation_sessions;

/// Booking status of a consultation. Stored as uppercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl FromStr for SessionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Which side of the consultation an identity is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// The farmer who booked the consultation.
    Requester,
    /// The expert who accepted it. Their departure ends the call.
    Responder,
}

/// Raw row from `consultation_sessions`.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = consultation_sessions)]
pub struct SessionRow {
    pub id: String,
    pub requester_id: String,
    pub responder_id: String,
    pub room_token: Option<String>,
    pub status: String,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = consultation_sessions)]
pub struct NewSession<'a> {
    pub id: &'a str,
    pub requester_id: &'a str,
    pub responder_id: &'a str,
    pub room_token: Option<&'a str>,
    pub status: &'a str,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The subset of a consultation the call coordinator works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub requester_id: String,
    pub responder_id: String,
    pub room_token: Option<String>,
    pub status: SessionStatus,
}

impl SessionRecord {
    /// Role of `identity` in this session, if it is a participant at all.
    pub fn role_of(&self, identity: &str) -> Option<ParticipantRole> {
        if identity == self.responder_id {
            Some(ParticipantRole::Responder)
        } else if identity == self.requester_id {
            Some(ParticipantRole::Requester)
        } else {
            None
        }
    }

    /// Room token of a session that may currently host a live call.
    pub fn joinable_room(&self) -> Option<&str> {
        match self.status {
            SessionStatus::Confirmed => self.room_token.as_deref(),
            _ => None,
        }
    }
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = UnknownStatus;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse()?,
            id: row.id,
            requester_id: row.requester_id,
            responder_id: row.responder_id,
            room_token: row.room_token,
        })
    }
}
