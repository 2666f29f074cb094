//! Live call gateway: WebSocket front door and the signaling core behind it.

pub mod connections;
pub mod events;
pub mod lifecycle;
pub mod relay;
pub mod rooms;
pub mod server;
pub mod session;
