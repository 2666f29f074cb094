use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::models::session::SessionStatus;

// ---------------------------------------------------------------------------
// HTTP errors
// ---------------------------------------------------------------------------

/// Structured API error returned to clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Vec<FieldError>>,
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED".to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR".to_string(),
            message: "Validation failed".to_string(),
            details: Some(details),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Session directory errors
// ---------------------------------------------------------------------------

/// Failure talking to the consultation store.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    #[error("session {session_id} has unknown status {status:?}")]
    Corrupt { session_id: String, status: String },
}

impl From<diesel::result::Error> for DirectoryError {
    fn from(err: diesel::result::Error) -> Self {
        tracing::error!(?err, "database error");
        Self::Unavailable(err.to_string())
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for DirectoryError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        tracing::error!(?err, "pool error");
        Self::Unavailable(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Signaling errors
// ---------------------------------------------------------------------------

/// Errors reported back to the connection that sent the offending event.
///
/// None of these close the connection or reach other room members.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("You are not a participant of this session")]
    Unauthorized,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session is {0} and cannot be joined")]
    SessionNotJoinable(SessionStatus),

    #[error("Room not found")]
    RoomNotFound,

    #[error("You have not joined this room")]
    NotAMember,

    #[error("Session directory unavailable, try again")]
    DirectoryUnavailable,

    #[error("{0}")]
    BadRequest(String),
}

impl SignalError {
    /// Stable code carried in the `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionNotJoinable(_) => "SESSION_NOT_JOINABLE",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::NotAMember => "NOT_A_MEMBER",
            Self::DirectoryUnavailable => "DIRECTORY_UNAVAILABLE",
            Self::BadRequest(_) => "BAD_REQUEST",
        }
    }

    /// Whether the client may retry the same event unchanged.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::DirectoryUnavailable)
    }
}

impl From<DirectoryError> for SignalError {
    fn from(err: DirectoryError) -> Self {
        tracing::warn!(%err, "session lookup failed");
        Self::DirectoryUnavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_error_codes() {
        assert_eq!(SignalError::Unauthorized.code(), "UNAUTHORIZED");
        assert_eq!(
            SignalError::SessionNotJoinable(SessionStatus::Completed).code(),
            "SESSION_NOT_JOINABLE"
        );
        assert_eq!(SignalError::NotAMember.code(), "NOT_A_MEMBER");
    }

    #[test]
    fn only_directory_failures_are_retryable() {
        assert!(SignalError::DirectoryUnavailable.retryable());
        assert!(!SignalError::Unauthorized.retryable());
        assert!(!SignalError::RoomNotFound.retryable());
    }

    #[test]
    fn not_joinable_message_names_status() {
        let err = SignalError::SessionNotJoinable(SessionStatus::Cancelled);
        assert_eq!(err.to_string(), "Session is CANCELLED and cannot be joined");
    }

    #[test]
    fn directory_error_maps_to_unavailable() {
        let err: SignalError = DirectoryError::Unavailable("timeout".to_string()).into();
        assert_eq!(err, SignalError::DirectoryUnavailable);
    }
}
