//! Public rooms: short lowercase codes anyone can type in

use tokio::time::Instant;
use tracing::{debug, info};

use tandem_core::crypto::validate_public_room_id;

use crate::messages::ServerMessage;
use crate::registry::{RoomKey, RoomRegistry};

/// Result of a `join-public-room`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Invalid,
    RateLimited,
}

/// Create a room under a fresh id and put `peer_id` in it
pub fn create<F>(
    registry: &mut dyn RoomRegistry,
    peer_id: &str,
    mut generate: F,
) -> Result<Option<String>, getrandom::Error>
where
    F: FnMut() -> Result<String, getrandom::Error>,
{
    if registry.peer(peer_id).is_none() {
        return Ok(None);
    }

    let room_id = loop {
        let candidate = generate()?;
        if !registry.contains_room(&RoomKey::public(candidate.as_str())) {
            break candidate;
        }
        debug!("Public room id {} taken, drawing again", candidate);
    };

    registry.send_to(
        peer_id,
        ServerMessage::PublicRoomCreated {
            room_id: room_id.clone(),
        },
    );
    registry.join(peer_id, &RoomKey::public(room_id.as_str()));
    info!("Public room {} created by {}", room_id, peer_id);
    Ok(Some(room_id))
}

/// Join an existing public room, or create it when `create_if_missing` is set
pub fn join(
    registry: &mut dyn RoomRegistry,
    peer_id: &str,
    room_id: &str,
    create_if_missing: bool,
    now: Instant,
) -> JoinOutcome {
    let Some(peer) = registry.peer_mut(peer_id) else {
        return JoinOutcome::Invalid;
    };
    if !peer.rate.try_acquire(now) {
        peer.send(ServerMessage::PairingRateLimited);
        debug!("Peer {} rate limited on public room join", peer_id);
        return JoinOutcome::RateLimited;
    }

    let room = RoomKey::public(room_id);
    let exists = registry.contains_room(&room);
    if !validate_public_room_id(room_id) || (!exists && !create_if_missing) {
        registry.send_to(
            peer_id,
            ServerMessage::PublicRoomInvalid {
                room_id: room_id.to_string(),
            },
        );
        return JoinOutcome::Invalid;
    }

    registry.join(peer_id, &room);
    JoinOutcome::Joined
}

/// Leave the current public room (if any) and confirm
pub fn leave(registry: &mut dyn RoomRegistry, peer_id: &str) {
    let Some(current) = registry.peer(peer_id).map(|p| p.public_room.clone()) else {
        return;
    };
    if let Some(room_id) = current {
        registry.leave(peer_id, &RoomKey::public(room_id), false);
    }
    registry.send_to(peer_id, ServerMessage::PublicRoomLeft);
}
