//! Room registry
//!
//! Peers live in one table keyed by id; rooms are buckets of peer ids in
//! three namespaces (address, secret, public). Every membership change is
//! announced to the other members of the room:
//!
//! - the joiner gets one `peers` snapshot of everyone already there
//! - existing members get `peer-joined`
//! - remaining members get `peer-left` when someone leaves
//!
//! A room that loses its last member is removed on the spot, so a later
//! join always starts from an empty room.

use std::collections::HashMap;

use tracing::debug;

use crate::messages::{RoomType, ServerMessage};
use crate::peer::{PeerId, PeerRecord};

/// Namespaced room identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub kind: RoomType,
    pub id: String,
}

impl RoomKey {
    pub fn address(id: impl Into<String>) -> Self {
        Self {
            kind: RoomType::Address,
            id: id.into(),
        }
    }

    pub fn secret(id: impl Into<String>) -> Self {
        Self {
            kind: RoomType::Secret,
            id: id.into(),
        }
    }

    pub fn public(id: impl Into<String>) -> Self {
        Self {
            kind: RoomType::Public,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            RoomType::Address => "address",
            RoomType::Secret => "secret",
            RoomType::Public => "public",
        };
        // Secret tokens are credentials, keep them out of logs
        if self.kind == RoomType::Secret {
            write!(f, "{}:{}…", kind, self.id.chars().take(6).collect::<String>())
        } else {
            write!(f, "{}:{}", kind, self.id)
        }
    }
}

/// Peer table plus room membership
///
/// Callers serialize access (the hub keeps the registry behind a mutex),
/// so every method sees and leaves a consistent state.
pub trait RoomRegistry: Send {
    /// Add a peer to the peer table, returning any record it replaced
    fn insert_peer(&mut self, peer: PeerRecord) -> Option<PeerRecord>;

    /// Drop a peer from the peer table. Memberships must already be gone.
    fn remove_peer(&mut self, peer_id: &str) -> Option<PeerRecord>;

    fn peer(&self, peer_id: &str) -> Option<&PeerRecord>;

    fn peer_mut(&mut self, peer_id: &str) -> Option<&mut PeerRecord>;

    /// Join a room, leaving and rejoining if already a member
    fn join(&mut self, peer_id: &str, room: &RoomKey);

    /// Leave a room. Returns `false` (and notifies nobody) if not a member.
    fn leave(&mut self, peer_id: &str, room: &RoomKey, is_disconnect: bool) -> bool;

    fn is_member(&self, room: &RoomKey, peer_id: &str) -> bool;

    /// Member ids in registry order; empty if the room does not exist
    fn members(&self, room: &RoomKey) -> Vec<PeerId>;

    fn contains_room(&self, room: &RoomKey) -> bool;

    /// Move a secret room to a new token in one step, returning its members
    fn rekey_secret_room(&mut self, old: &str, new: &str) -> Vec<PeerId>;

    fn room_count(&self) -> usize;

    fn peer_count(&self) -> usize;

    /// Queue a message for one peer; unknown peers are ignored
    fn send_to(&self, peer_id: &str, msg: ServerMessage) {
        if let Some(peer) = self.peer(peer_id) {
            peer.send(msg);
        }
    }

    /// Remove every member of a room, returning who was in it
    fn delete_room(&mut self, room: &RoomKey) -> Vec<PeerId> {
        let members = self.members(room);
        for member in &members {
            self.leave(member, room, true);
        }
        members
    }

    /// Leave the address room, every secret room and the public room
    fn leave_all(&mut self, peer_id: &str, is_disconnect: bool) {
        let Some(peer) = self.peer(peer_id) else {
            return;
        };
        let address = RoomKey::address(peer.address.clone());
        let secrets: Vec<String> = peer.secret_rooms.iter().cloned().collect();
        let public = peer.public_room.clone();

        self.leave(peer_id, &address, is_disconnect);
        for secret in secrets {
            self.leave(peer_id, &RoomKey::secret(secret), is_disconnect);
        }
        if let Some(public) = public {
            self.leave(peer_id, &RoomKey::public(public), is_disconnect);
        }
    }
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    peers: HashMap<PeerId, PeerRecord>,
    /// Member ids in join order
    rooms: HashMap<RoomKey, Vec<PeerId>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomRegistry for MemoryRegistry {
    fn insert_peer(&mut self, peer: PeerRecord) -> Option<PeerRecord> {
        self.peers.insert(peer.id.clone(), peer)
    }

    fn remove_peer(&mut self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.remove(peer_id)
    }

    fn peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    fn peer_mut(&mut self, peer_id: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer_id)
    }

    fn join(&mut self, peer_id: &str, room: &RoomKey) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        let previous_public = peer.public_room.clone();

        // Leave first so nobody ever sees `peer-left` after the matching `peer-joined`
        if self.is_member(room, peer_id) {
            self.leave(peer_id, room, false);
        }
        if room.kind == RoomType::Public {
            if let Some(previous) = previous_public.filter(|p| *p != room.id) {
                self.leave(peer_id, &RoomKey::public(previous), false);
            }
        }

        let Some(joiner) = self.peers.get(peer_id) else {
            return;
        };
        let descriptor = joiner.descriptor();
        let members = self.rooms.entry(room.clone()).or_default();
        if members.is_empty() {
            debug!("Room {} created", room);
        }

        let mut snapshot = Vec::with_capacity(members.len());
        for member_id in members.iter() {
            if let Some(member) = self.peers.get(member_id) {
                member.send(ServerMessage::PeerJoined {
                    peer: descriptor.clone(),
                    room_type: room.kind,
                    room_id: room.id.clone(),
                });
                snapshot.push(member.descriptor());
            }
        }
        members.push(peer_id.to_string());

        if let Some(joiner) = self.peers.get_mut(peer_id) {
            match room.kind {
                RoomType::Address => {}
                RoomType::Secret => {
                    joiner.secret_rooms.insert(room.id.clone());
                }
                RoomType::Public => joiner.public_room = Some(room.id.clone()),
            }
            joiner.send(ServerMessage::Peers {
                peers: snapshot,
                room_type: room.kind,
                room_id: room.id.clone(),
            });
        }
        debug!("Peer {} joined {}", peer_id, room);
    }

    fn leave(&mut self, peer_id: &str, room: &RoomKey, is_disconnect: bool) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let Some(position) = members.iter().position(|m| m == peer_id) else {
            return false;
        };
        members.remove(position);
        let remaining = members.clone();

        if remaining.is_empty() {
            self.rooms.remove(room);
            debug!("Room {} removed (empty)", room);
        } else {
            for member_id in &remaining {
                if let Some(member) = self.peers.get(member_id) {
                    member.send(ServerMessage::PeerLeft {
                        peer_id: peer_id.to_string(),
                        room_type: room.kind,
                        room_id: room.id.clone(),
                        is_disconnect,
                    });
                }
            }
        }

        if let Some(peer) = self.peers.get_mut(peer_id) {
            match room.kind {
                RoomType::Address => {}
                RoomType::Secret => {
                    peer.secret_rooms.remove(&room.id);
                }
                RoomType::Public => {
                    if peer.public_room.as_deref() == Some(room.id.as_str()) {
                        peer.public_room = None;
                    }
                }
            }
        }
        debug!("Peer {} left {}", peer_id, room);
        true
    }

    fn is_member(&self, room: &RoomKey, peer_id: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.iter().any(|m| m == peer_id))
    }

    fn members(&self, room: &RoomKey) -> Vec<PeerId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    fn contains_room(&self, room: &RoomKey) -> bool {
        self.rooms.contains_key(room)
    }

    fn rekey_secret_room(&mut self, old: &str, new: &str) -> Vec<PeerId> {
        let Some(members) = self.rooms.remove(&RoomKey::secret(old)) else {
            return Vec::new();
        };

        let target = self.rooms.entry(RoomKey::secret(new)).or_default();
        for member in &members {
            if !target.contains(member) {
                target.push(member.clone());
            }
        }

        for member in &members {
            if let Some(peer) = self.peers.get_mut(member) {
                peer.secret_rooms.remove(old);
                peer.secret_rooms.insert(new.to_string());
            }
        }
        members
    }

    fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
