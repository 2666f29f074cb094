//! Single-use WebSocket tickets.
//!
//! The platform's auth service authenticates the user, then asks us to mint a
//! ticket bound to that identity. The browser presents it in IDENTIFY.

use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

/// WS ticket TTL in seconds.
pub const WS_TICKET_TTL_SECS: u64 = 30;

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

/// Compare a presented shared secret against the configured one.
///
/// Both sides are MAC'd under one key and the tags compared with
/// `hmac::verify`, which does not short-circuit on the first differing byte.
pub fn secrets_match(presented: &str, expected: &str) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, b"consult-issuer-secret");
    let expected_tag = hmac::sign(&key, expected.as_bytes());
    hmac::verify(&key, presented.as_bytes(), expected_tag.as_ref()).is_ok()
}

/// Data stored alongside a WS ticket.
#[derive(Debug, Serialize, Deserialize)]
pub struct WsTicketData {
    pub identity: String,
}

pub fn generate_ws_ticket() -> String {
    generate_opaque_token("wst", 32)
}

fn ticket_key(ticket: &str) -> String {
    format!("consult:wst:{ticket}")
}

pub async fn store_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
    data: &WsTicketData,
) -> Result<(), ApiError> {
    let value = serde_json::to_string(data).map_err(|_| ApiError::internal("serialization"))?;
    kv.set_ex(&ticket_key(ticket), &value, WS_TICKET_TTL_SECS).await
}

/// Look up and delete a ticket in one step.
pub async fn consume_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
) -> Result<Option<WsTicketData>, ApiError> {
    match kv.take(&ticket_key(ticket)).await? {
        Some(v) => {
            let data: WsTicketData =
                serde_json::from_str(&v).map_err(|_| ApiError::internal("corrupt ticket data"))?;
            Ok(Some(data))
        }
        None => Ok(None),
    }
}

/// Mint and store a ticket for an already-authenticated identity.
pub async fn issue_ws_ticket(kv: &dyn KeyValueStore, identity: &str) -> Result<String, ApiError> {
    let ticket = generate_ws_ticket();
    store_ws_ticket(
        kv,
        &ticket,
        &WsTicketData {
            identity: identity.to_string(),
        },
    )
    .await?;
    Ok(ticket)
}
