#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use consult_api::config::Config;
use consult_api::db::kv::{KeyValueStore, MemoryStore};
use consult_api::directory::MemoryDirectory;
use consult_api::gateway::relay::SignalingRelay;
use consult_api::models::session::{SessionRecord, SessionStatus};
use consult_api::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const ISSUER_SECRET: &str = "test-issuer-secret";
pub const FARMER: &str = "usr_farmer";
pub const EXPERT: &str = "usr_expert";

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused/consult_test".to_string(),
        database_pool_size: 1,
        ticket_issuer_secret: ISSUER_SECRET.to_string(),
        port: 0,
        heartbeat_interval_ms: 41250,
    }
}

pub fn confirmed_session(id: &str, room_token: &str) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        requester_id: FARMER.to_string(),
        responder_id: EXPERT.to_string(),
        room_token: Some(room_token.to_string()),
        status: SessionStatus::Confirmed,
    }
}

/// Build a test AppState over an in-memory directory seeded with `ses_1`/`r1`.
pub fn test_state() -> (AppState, Arc<MemoryDirectory>) {
    let directory = Arc::new(MemoryDirectory::new());
    directory.insert(confirmed_session("ses_1", "r1"));

    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let state = AppState {
        kv,
        config: Arc::new(test_config()),
        relay: Arc::new(SignalingRelay::new(directory.clone())),
    };
    (state, directory)
}

pub fn test_app() -> (Router, AppState, Arc<MemoryDirectory>) {
    let (state, directory) = test_state();
    let app = consult_api::routes::router().with_state(state.clone());
    (app, state, directory)
}

/// Start an actual TCP server for WebSocket testing.
pub async fn start_ws_server() -> (SocketAddr, AppState, Arc<MemoryDirectory>) {
    let (app, state, directory) = test_app();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    (addr, state, directory)
}

pub async fn ticket_for(state: &AppState, identity: &str) -> String {
    consult_api::auth::tokens::issue_ws_ticket(state.kv.as_ref(), identity)
        .await
        .expect("issue ticket")
}

pub async fn connect(addr: SocketAddr) -> Ws {
    let url = format!("ws://{addr}/gateway");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next raw frame, skipping pings/pongs.
pub async fn next_frame(ws: &mut Ws) -> tungstenite::Message {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => return other,
        }
    }
}

pub async fn recv_json(ws: &mut Ws) -> serde_json::Value {
    let msg = next_frame(ws).await;
    let text = msg.into_text().expect("not text");
    serde_json::from_str(&text).expect("parse frame")
}

/// Read dispatch frames until one named `event` arrives.
pub async fn recv_event(ws: &mut Ws, event: &str) -> serde_json::Value {
    loop {
        let frame = recv_json(ws).await;
        if frame["t"] == event {
            return frame;
        }
    }
}

/// Connect, IDENTIFY with a fresh ticket and read READY.
pub async fn connect_as(addr: SocketAddr, state: &AppState, identity: &str) -> Ws {
    let ticket = ticket_for(state, identity).await;
    let mut ws = connect(addr).await;
    send_json(&mut ws, serde_json::json!({ "op": 2, "d": { "ticket": ticket } })).await;

    let ready = recv_json(&mut ws).await;
    assert_eq!(ready["op"], 0, "READY should be op=0 (DISPATCH)");
    assert_eq!(ready["t"], "READY");
    assert_eq!(ready["d"]["identity"], identity);
    ws
}

pub async fn send_event(ws: &mut Ws, name: &str, data: serde_json::Value) {
    send_json(ws, serde_json::json!({ "op": 0, "t": name, "d": data })).await;
}
