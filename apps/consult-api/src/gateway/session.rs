//! Per-connection gateway session state.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use super::events::ServerEvent;

/// Sending half of a connection's outbound queue.
///
/// Sends never block, so they are safe inside a room's critical section. The
/// connection loop drains the queue onto the socket.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event. Returns `false` if the connection is already gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// State for a single WebSocket connection.
pub struct GatewaySession {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Verified identity from the IDENTIFY ticket.
    pub identity: String,
    /// Queue drained onto this connection's socket.
    pub outbound: Outbound,
    /// Monotonically increasing sequence number for dispatch events.
    seq: AtomicU64,
}

impl GatewaySession {
    pub fn new(connection_id: String, identity: String, outbound: Outbound) -> Self {
        Self {
            connection_id,
            identity,
            outbound,
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}
