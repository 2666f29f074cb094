//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time;

use crate::auth::tokens;
use crate::error::SignalError;
use crate::AppState;

use super::events::{
    ClientEvent, ClientMessage, EventName, GatewayMessage, HeartbeatPayload, IdentifyPayload,
    ServerEvent, OP_DISPATCH, OP_HEARTBEAT, OP_IDENTIFY,
};
use super::session::{GatewaySession, Outbound};

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for IDENTIFY within timeout.
    let identify = time::timeout(
        Duration::from_secs(IDENTIFY_TIMEOUT_SECS),
        read_identify(&mut ws_rx),
    )
    .await;

    let payload = match identify {
        Ok(Ok(payload)) => payload,
        Ok(Err((code, reason))) => {
            tracing::debug!(%reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, code, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Step 2: Redeem the ticket for the caller's identity.
    let identity = match tokens::consume_ws_ticket(state.kv.as_ref(), &payload.ticket).await {
        Ok(Some(data)) => data.identity,
        Ok(None) => {
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, "Invalid or expired ticket").await;
            return;
        }
        Err(_) => {
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, "Ticket lookup failed").await;
            return;
        }
    };

    let (outbound, outbound_rx) = Outbound::channel();
    let session = GatewaySession::new(
        consult_common::id::prefixed_ulid(consult_common::id::prefix::CONNECTION),
        identity,
        outbound,
    );
    state.relay.register(&session);

    tracing::info!(
        connection_id = %session.connection_id,
        identity = %session.identity,
        "gateway connection established"
    );

    let ready = GatewayMessage::dispatch(
        EventName::READY,
        session.next_seq(),
        serde_json::json!({
            "connectionId": session.connection_id,
            "identity": session.identity,
            "heartbeatInterval": state.config.heartbeat_interval_ms,
        }),
    );
    if send_message(&mut ws_tx, &ready).await {
        run_session(&state, &session, ws_tx, ws_rx, outbound_rx).await;
    }

    // Whatever ended the loop, the connection is gone: clean up its rooms.
    state.relay.disconnect(&session.connection_id).await;

    tracing::info!(
        connection_id = %session.connection_id,
        identity = %session.identity,
        "gateway connection ended"
    );
}

/// Read frames until the first meaningful one, which must be IDENTIFY.
async fn read_identify(ws_rx: &mut WsStream) -> Result<IdentifyPayload, (u16, &'static str)> {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => return Err((CLOSE_UNKNOWN_ERROR, "Client closed")),
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(?e, "ws read error during identify");
                return Err((CLOSE_UNKNOWN_ERROR, "Read error"));
            }
        };

        let client_msg: ClientMessage = serde_json::from_str(&text)
            .map_err(|_| (CLOSE_UNKNOWN_ERROR, "Invalid JSON"))?;

        if client_msg.op != OP_IDENTIFY {
            return Err((CLOSE_NOT_AUTHENTICATED, "Expected IDENTIFY"));
        }
        return serde_json::from_value(client_msg.d)
            .map_err(|_| (CLOSE_AUTH_FAILED, "Invalid identify payload"));
    }
    Err((CLOSE_UNKNOWN_ERROR, "Connection closed before identify"))
}

/// Main event loop: decode client events, drain the outbound queue, enforce
/// heartbeats. Returns when the connection should be torn down.
async fn run_session(
    state: &AppState,
    session: &GatewaySession,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut outbound_rx: UnboundedReceiver<ServerEvent>,
) {
    let mut heartbeat_timer = time::interval(heartbeat_deadline(state.config.heartbeat_interval_ms));
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                };

                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                        break;
                    }
                };

                match client_msg.op {
                    OP_HEARTBEAT => {
                        got_heartbeat = true;
                        let payload: HeartbeatPayload =
                            serde_json::from_value(client_msg.d).unwrap_or(HeartbeatPayload { seq: 0 });
                        if !send_message(&mut ws_tx, &GatewayMessage::heartbeat_ack(payload.seq)).await {
                            break;
                        }
                    }
                    OP_DISPATCH => {
                        let result = match client_msg.t.as_deref() {
                            Some(name) => match ClientEvent::decode(name, client_msg.d) {
                                Ok(event) => state.relay.handle(session, event).await,
                                Err(err) => Err(err),
                            },
                            None => Err(SignalError::BadRequest("missing event name".to_string())),
                        };
                        if let Err(err) = result {
                            tracing::debug!(
                                connection_id = %session.connection_id,
                                code = err.code(),
                                %err,
                                "signaling event refused"
                            );
                            // Errors go back to this connection only.
                            session.outbound.send(ServerEvent::Error(err));
                        }
                    }
                    OP_IDENTIFY => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                        break;
                    }
                    _ => {
                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                        break;
                    }
                }
            }

            Some(event) = outbound_rx.recv() => {
                let msg = GatewayMessage::event(session.next_seq(), &event);
                if !send_message(&mut ws_tx, &msg).await {
                    break;
                }
            }

            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Clients must heartbeat within 1.5x the advertised interval.
fn heartbeat_deadline(interval_ms: u64) -> Duration {
    Duration::from_millis((interval_ms.saturating_mul(3) / 2).max(1))
}

/// Serialize and send a gateway message. Returns `false` if the socket is gone.
async fn send_message(ws_tx: &mut WsSink, msg: &GatewayMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(?e, "failed to serialize gateway message");
            return true;
        }
    };
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
