//! Live call rooms keyed by the session's room token.
//!
//! Every mutation of a room runs while holding that room's `DashMap` entry
//! guard, which makes the entry guard the room's single-writer section.
//! The matching `ConnectionRegistry` update happens inside the same section,
//! so the two indexes never disagree about who is in a room. Lock order is
//! always room entry, then connection entry.
//!
//! Nothing in here awaits. Notifications go through non-blocking outbound
//! queues.

use std::collections::{BTreeSet, HashMap};

use dashmap::DashMap;

use crate::error::SignalError;
use crate::models::session::ParticipantRole;

use super::connections::ConnectionRegistry;
use super::events::ServerEvent;
use super::session::Outbound;

/// One connection joined to a room.
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: String,
    pub identity: String,
    pub role: ParticipantRole,
    pub outbound: Outbound,
}

struct Room {
    session_id: String,
    /// Keyed by connection id.
    participants: HashMap<String, Participant>,
}

impl Room {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            participants: HashMap::new(),
        }
    }

    fn has_identity(&self, identity: &str) -> bool {
        self.participants.values().any(|p| p.identity == identity)
    }

    fn has_role(&self, role: ParticipantRole) -> bool {
        self.participants.values().any(|p| p.role == role)
    }

    fn is_ready(&self) -> bool {
        self.has_role(ParticipantRole::Requester) && self.has_role(ParticipantRole::Responder)
    }

    /// Distinct identities present, excluding `identity`.
    fn identities_except(&self, identity: &str) -> Vec<String> {
        self.participants
            .values()
            .filter(|p| p.identity != identity)
            .map(|p| p.identity.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// What the joiner learns about the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Other identities already in the room.
    pub peers: Vec<String>,
    /// The connection was already a member; nothing changed.
    pub already_joined: bool,
    /// This join brought both roles into the room.
    pub became_ready: bool,
}

/// Facts about a departure, used to decide whether the session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub session_id: String,
    pub room_token: String,
    pub identity: String,
    pub role: ParticipantRole,
    /// The same identity still has another connection in the room.
    pub identity_still_present: bool,
    pub remaining: usize,
}

impl Departure {
    pub fn room_emptied(&self) -> bool {
        self.remaining == 0
    }
}

/// Shared registry of all live rooms.
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a participant, creating the room on first join.
    ///
    /// Inside the room's section this sends, in order: `joined-room` to the
    /// joiner, `peer-joined` to connections of other identities, and
    /// `room-ready` to everyone if both roles are now present for the first
    /// time.
    pub fn join(
        &self,
        room_token: &str,
        session_id: &str,
        participant: Participant,
        index: &ConnectionRegistry,
    ) -> Result<JoinOutcome, SignalError> {
        let mut room = self
            .rooms
            .entry(room_token.to_string())
            .or_insert_with(|| Room::new(session_id));

        if room.participants.contains_key(&participant.connection_id) {
            let peers = room.identities_except(&participant.identity);
            participant.outbound.send(ServerEvent::JoinedRoom {
                session_id: room.session_id.clone(),
                room_token: room_token.to_string(),
                role: participant.role,
                peers: peers.clone(),
            });
            return Ok(JoinOutcome {
                peers,
                already_joined: true,
                became_ready: false,
            });
        }

        if !index.add_membership(&participant.connection_id, room_token) {
            // Connection is mid-disconnect; don't leave an orphan behind.
            drop(room);
            self.rooms
                .remove_if(room_token, |_, r| r.participants.is_empty());
            return Err(SignalError::NotAMember);
        }

        let was_ready = room.is_ready();
        let peers = room.identities_except(&participant.identity);

        participant.outbound.send(ServerEvent::JoinedRoom {
            session_id: room.session_id.clone(),
            room_token: room_token.to_string(),
            role: participant.role,
            peers: peers.clone(),
        });
        for other in room.participants.values() {
            if other.identity != participant.identity {
                other.outbound.send(ServerEvent::PeerJoined {
                    identity: participant.identity.clone(),
                });
            }
        }

        room.participants
            .insert(participant.connection_id.clone(), participant);

        let became_ready = !was_ready && room.is_ready();
        if became_ready {
            for p in room.participants.values() {
                p.outbound.send(ServerEvent::RoomReady {
                    room_token: room_token.to_string(),
                });
            }
        }

        tracing::debug!(
            %room_token,
            participants = room.participants.len(),
            "participant joined room"
        );

        Ok(JoinOutcome {
            peers,
            already_joined: false,
            became_ready,
        })
    }

    /// Remove a connection from a room, deleting the room if it empties.
    pub fn leave(
        &self,
        room_token: &str,
        connection_id: &str,
        index: &ConnectionRegistry,
    ) -> Result<Departure, SignalError> {
        let departure = {
            let mut room = self
                .rooms
                .get_mut(room_token)
                .ok_or(SignalError::RoomNotFound)?;
            let gone = room
                .participants
                .remove(connection_id)
                .ok_or(SignalError::NotAMember)?;
            index.remove_membership(connection_id, room_token);

            let identity_still_present = room.has_identity(&gone.identity);
            if !identity_still_present {
                for p in room.participants.values() {
                    p.outbound.send(ServerEvent::PeerLeft {
                        identity: gone.identity.clone(),
                    });
                }
            }

            Departure {
                session_id: room.session_id.clone(),
                room_token: room_token.to_string(),
                identity: gone.identity,
                role: gone.role,
                identity_still_present,
                remaining: room.participants.len(),
            }
        };

        if departure.room_emptied() {
            // A join may have slipped in after the guard dropped; only remove
            // the room if it is still empty.
            if self
                .rooms
                .remove_if(room_token, |_, r| r.participants.is_empty())
                .is_some()
            {
                tracing::info!(%room_token, "room destroyed");
            }
        }

        Ok(departure)
    }

    /// Connection ids of everyone in the room except `excluding`.
    pub fn relay_targets(&self, room_token: &str, excluding: &str) -> Vec<String> {
        self.rooms
            .get(room_token)
            .map(|room| {
                room.participants
                    .keys()
                    .filter(|id| id.as_str() != excluding)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver `event` to every participant except `excluding`. Runs in the
    /// room's section so relays are ordered with joins and leaves.
    pub fn forward(
        &self,
        room_token: &str,
        excluding: &str,
        event: ServerEvent,
    ) -> Result<usize, SignalError> {
        let room = self
            .rooms
            .get_mut(room_token)
            .ok_or(SignalError::RoomNotFound)?;
        if !room.participants.contains_key(excluding) {
            return Err(SignalError::NotAMember);
        }

        let mut delivered = 0;
        for (id, p) in room.participants.iter() {
            if id != excluding && p.outbound.send(event.clone()) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Evict everyone and delete the room. Each evicted connection receives
    /// `farewell` if given. Returns the evicted connection ids.
    pub fn close(
        &self,
        room_token: &str,
        index: &ConnectionRegistry,
        farewell: Option<ServerEvent>,
    ) -> Vec<String> {
        let evicted: Vec<String> = {
            let Some(mut room) = self.rooms.get_mut(room_token) else {
                return Vec::new();
            };
            room.participants
                .drain()
                .map(|(id, p)| {
                    index.remove_membership(&id, room_token);
                    if let Some(event) = &farewell {
                        p.outbound.send(event.clone());
                    }
                    id
                })
                .collect()
        };

        self.rooms
            .remove_if(room_token, |_, r| r.participants.is_empty());
        tracing::info!(%room_token, evicted = evicted.len(), "room closed");
        evicted
    }

    pub fn contains(&self, room_token: &str) -> bool {
        self.rooms.contains_key(room_token)
    }

    #[cfg(test)]
    pub fn participant_count(&self, room_token: &str) -> usize {
        self.rooms
            .get(room_token)
            .map(|r| r.participants.len())
            .unwrap_or(0)
    }

    /// Connection ids currently in the room.
    #[cfg(test)]
    pub fn members(&self, room_token: &str) -> Vec<String> {
        self.rooms
            .get(room_token)
            .map(|r| r.participants.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Tokens of all live rooms.
    #[cfg(test)]
    pub fn tokens(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn participant(
        index: &ConnectionRegistry,
        conn: &str,
        identity: &str,
        role: ParticipantRole,
    ) -> (Participant, UnboundedReceiver<ServerEvent>) {
        index.register_connection(conn, identity);
        let (outbound, rx) = Outbound::channel();
        (
            Participant {
                connection_id: conn.to_string(),
                identity: identity.to_string(),
                role,
                outbound,
            },
            rx,
        )
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn first_join_creates_room_without_peer_notification() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (f, mut f_rx) = participant(&index, "c_f", "usr_f", ParticipantRole::Requester);

        let outcome = rooms.join("r1", "ses_1", f, &index).unwrap();
        assert!(outcome.peers.is_empty());
        assert!(!outcome.became_ready);
        assert!(rooms.contains("r1"));
        assert!(index.is_member("c_f", "r1"));

        let events = drain(&mut f_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::JoinedRoom { .. }));
    }

    #[test]
    fn second_identity_triggers_peer_joined_and_room_ready() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (f, mut f_rx) = participant(&index, "c_f", "usr_f", ParticipantRole::Requester);
        let (e, mut e_rx) = participant(&index, "c_e", "usr_e", ParticipantRole::Responder);

        rooms.join("r1", "ses_1", f, &index).unwrap();
        drain(&mut f_rx);
        let outcome = rooms.join("r1", "ses_1", e, &index).unwrap();

        assert_eq!(outcome.peers, vec!["usr_f".to_string()]);
        assert!(outcome.became_ready);
        assert_eq!(
            drain(&mut f_rx),
            vec![
                ServerEvent::PeerJoined { identity: "usr_e".into() },
                ServerEvent::RoomReady { room_token: "r1".into() },
            ]
        );
        let e_events = drain(&mut e_rx);
        assert!(matches!(e_events[0], ServerEvent::JoinedRoom { .. }));
        assert_eq!(e_events[1], ServerEvent::RoomReady { room_token: "r1".into() });
    }

    #[test]
    fn rejoin_with_same_connection_is_noop() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (f, _f_rx) = participant(&index, "c_f", "usr_f", ParticipantRole::Requester);

        rooms.join("r1", "ses_1", f.clone(), &index).unwrap();
        let again = rooms.join("r1", "ses_1", f, &index).unwrap();
        assert!(again.already_joined);
        assert_eq!(rooms.participant_count("r1"), 1);
    }

    #[test]
    fn join_from_unregistered_connection_leaves_no_room() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (outbound, _rx) = Outbound::channel();
        let ghost = Participant {
            connection_id: "c_ghost".into(),
            identity: "usr_f".into(),
            role: ParticipantRole::Requester,
            outbound,
        };

        assert_eq!(
            rooms.join("r1", "ses_1", ghost, &index),
            Err(SignalError::NotAMember)
        );
        assert!(!rooms.contains("r1"));
    }

    #[test]
    fn last_leave_destroys_room() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (f, _f_rx) = participant(&index, "c_f", "usr_f", ParticipantRole::Requester);
        let (e, mut e_rx) = participant(&index, "c_e", "usr_e", ParticipantRole::Responder);
        rooms.join("r1", "ses_1", f, &index).unwrap();
        rooms.join("r1", "ses_1", e, &index).unwrap();
        drain(&mut e_rx);

        let d = rooms.leave("r1", "c_f", &index).unwrap();
        assert_eq!(d.remaining, 1);
        assert!(!d.identity_still_present);
        assert!(rooms.contains("r1"));
        assert_eq!(drain(&mut e_rx), vec![ServerEvent::PeerLeft { identity: "usr_f".into() }]);

        let d = rooms.leave("r1", "c_e", &index).unwrap();
        assert!(d.room_emptied());
        assert_eq!(d.role, ParticipantRole::Responder);
        assert!(!rooms.contains("r1"));
        assert!(index.rooms_of("c_e").is_empty());
    }

    #[test]
    fn leave_reports_identity_still_present_for_second_tab() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (e1, _rx1) = participant(&index, "c_e1", "usr_e", ParticipantRole::Responder);
        let (e2, _rx2) = participant(&index, "c_e2", "usr_e", ParticipantRole::Responder);
        rooms.join("r1", "ses_1", e1, &index).unwrap();
        rooms.join("r1", "ses_1", e2, &index).unwrap();

        let d = rooms.leave("r1", "c_e1", &index).unwrap();
        assert!(d.identity_still_present);
        assert_eq!(d.remaining, 1);
    }

    #[test]
    fn leave_errors() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (f, _rx) = participant(&index, "c_f", "usr_f", ParticipantRole::Requester);
        rooms.join("r1", "ses_1", f, &index).unwrap();

        assert_eq!(rooms.leave("r2", "c_f", &index), Err(SignalError::RoomNotFound));
        assert_eq!(rooms.leave("r1", "c_other", &index), Err(SignalError::NotAMember));
    }

    #[test]
    fn forward_reaches_everyone_but_sender() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (f, mut f_rx) = participant(&index, "c_f", "usr_f", ParticipantRole::Requester);
        let (e, mut e_rx) = participant(&index, "c_e", "usr_e", ParticipantRole::Responder);
        rooms.join("r1", "ses_1", f, &index).unwrap();
        rooms.join("r1", "ses_1", e, &index).unwrap();
        drain(&mut f_rx);
        drain(&mut e_rx);

        assert_eq!(rooms.relay_targets("r1", "c_e"), vec!["c_f".to_string()]);
        let ev = ServerEvent::PeerJoined { identity: "x".into() };
        assert_eq!(rooms.forward("r1", "c_e", ev.clone()).unwrap(), 1);
        assert_eq!(drain(&mut f_rx), vec![ev]);
        assert!(drain(&mut e_rx).is_empty());
    }

    #[test]
    fn close_evicts_and_clears_memberships() {
        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();
        let (f, mut f_rx) = participant(&index, "c_f", "usr_f", ParticipantRole::Requester);
        rooms.join("r1", "ses_1", f, &index).unwrap();
        drain(&mut f_rx);

        let bye = ServerEvent::SessionCompleted { session_id: "ses_1".into() };
        let evicted = rooms.close("r1", &index, Some(bye.clone()));
        assert_eq!(evicted, vec!["c_f".to_string()]);
        assert!(!rooms.contains("r1"));
        assert!(!index.is_member("c_f", "r1"));
        assert_eq!(drain(&mut f_rx), vec![bye]);

        assert!(rooms.close("r1", &index, None).is_empty());
    }

    #[test]
    fn concurrent_churn_on_one_room_leaves_nothing_behind() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 200;

        let rooms = RoomRegistry::new();
        let index = ConnectionRegistry::new();

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let rooms = &rooms;
                let index = &index;
                s.spawn(move || {
                    let conn = format!("c_{t}");
                    let (role, identity) = if t % 2 == 0 {
                        (ParticipantRole::Requester, "usr_f")
                    } else {
                        (ParticipantRole::Responder, "usr_e")
                    };
                    let (p, mut rx) = participant(index, &conn, identity, role);

                    for i in 0..ITERATIONS {
                        // Evicted by another thread's close: both errors are fine.
                        let _ = rooms.join("r1", "ses_1", p.clone(), index);
                        let _ = rooms.forward("r1", &conn, ServerEvent::PeerJoined {
                            identity: identity.into(),
                        });
                        if i % 17 == t {
                            rooms.close("r1", index, None);
                        }
                        let _ = rooms.leave("r1", &conn, index);
                        drain(&mut rx);

                        // Whatever happened, this connection is out of the room.
                        assert!(!index.is_member(&conn, "r1"));
                    }
                    index.drop_connection(&conn);
                });
            }
        });

        assert!(rooms.is_empty(), "room left behind: {:?}", rooms.tokens());
        assert!(index.is_empty());
    }
}
