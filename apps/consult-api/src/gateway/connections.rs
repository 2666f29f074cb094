//! Reverse index from live connections to the rooms they joined.
//!
//! Rooms hold the forward direction (room -> participants). This side exists
//! so a disconnect can enumerate its cleanup work, and so the relay can check
//! membership without trusting the room token a client sends.

use std::collections::HashSet;

use dashmap::DashMap;

struct ConnectionEntry {
    identity: String,
    rooms: HashSet<String>,
}

/// Thread-safe, DashMap-backed connection index.
pub struct ConnectionRegistry {
    inner: DashMap<String, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Register a connection after IDENTIFY. Re-registering resets its rooms.
    pub fn register_connection(&self, connection_id: &str, identity: &str) {
        self.inner.insert(
            connection_id.to_string(),
            ConnectionEntry {
                identity: identity.to_string(),
                rooms: HashSet::new(),
            },
        );
    }

    /// Record that a connection joined a room. Returns `false` if the
    /// connection is not registered (it is disconnecting).
    pub fn add_membership(&self, connection_id: &str, room_token: &str) -> bool {
        match self.inner.get_mut(connection_id) {
            Some(mut entry) => {
                entry.rooms.insert(room_token.to_string());
                true
            }
            None => false,
        }
    }

    /// Returns `true` if the membership existed.
    pub fn remove_membership(&self, connection_id: &str, room_token: &str) -> bool {
        self.inner
            .get_mut(connection_id)
            .map(|mut entry| entry.rooms.remove(room_token))
            .unwrap_or(false)
    }

    pub fn is_member(&self, connection_id: &str, room_token: &str) -> bool {
        self.inner
            .get(connection_id)
            .map(|entry| entry.rooms.contains(room_token))
            .unwrap_or(false)
    }

    pub fn identity_of(&self, connection_id: &str) -> Option<String> {
        self.inner.get(connection_id).map(|e| e.identity.clone())
    }

    pub fn rooms_of(&self, connection_id: &str) -> HashSet<String> {
        self.inner
            .get(connection_id)
            .map(|entry| entry.rooms.clone())
            .unwrap_or_default()
    }

    /// Remove a connection and hand back the rooms it was in. A second call
    /// for the same connection returns an empty set, so each room is cleaned
    /// up once.
    pub fn drop_connection(&self, connection_id: &str) -> HashSet<String> {
        self.inner
            .remove(connection_id)
            .map(|(_, entry)| entry.rooms)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
