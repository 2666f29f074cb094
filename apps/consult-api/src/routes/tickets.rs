//! Gateway ticket issuing for the platform's auth service.

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::tokens;
use crate::error::{ApiError, FieldError};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/tickets", post(issue_ticket))
}

// ---------------------------------------------------------------------------
// POST /api/v1/tickets
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TicketRequest {
    pub identity: String,
}

#[derive(Debug, Serialize)]
pub struct TicketResponse {
    pub ticket: String,
    pub expires_in: u64,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub async fn issue_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TicketRequest>,
) -> Result<Json<TicketResponse>, ApiError> {
    match bearer_token(&headers) {
        Some(secret) if tokens::secrets_match(secret, &state.config.ticket_issuer_secret) => {}
        _ => return Err(ApiError::unauthorized("Missing or invalid issuer credentials")),
    }

    let identity = body.identity.trim();
    if identity.is_empty() {
        return Err(ApiError::validation(vec![FieldError {
            field: "identity".to_string(),
            message: "must not be empty".to_string(),
        }]));
    }

    let ticket = tokens::issue_ws_ticket(state.kv.as_ref(), identity).await?;
    tracing::debug!(%identity, "gateway ticket issued");

    Ok(Json(TicketResponse {
        ticket,
        expires_in: tokens::WS_TICKET_TTL_SECS,
    }))
}
