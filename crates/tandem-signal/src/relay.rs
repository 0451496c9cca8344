//! Signal relay
//!
//! Forwards one peer's message to one named peer in a room they share.
//! The payload is opaque: only the envelope fields are read (`to`,
//! `roomType`, `roomId`), `to` is stripped, `sender` is stamped, and
//! everything else goes out untouched. Delivery is fire-and-forget.

use serde_json::Value;
use tracing::debug;

use crate::messages::{Outbound, Payload, RoomType};
use crate::registry::{RoomKey, RoomRegistry};

/// Relay `payload` from `sender_id`. Returns `false` if it was dropped.
pub fn relay(registry: &dyn RoomRegistry, sender_id: &str, mut payload: Payload) -> bool {
    let Some(sender) = registry.peer(sender_id) else {
        return false;
    };

    let Some(to) = payload.get("to").and_then(Value::as_str).map(str::to_owned) else {
        debug!("Dropping relay from {}: no recipient", sender_id);
        return false;
    };

    let room_type = payload
        .get("roomType")
        .and_then(Value::as_str)
        .and_then(RoomType::from_wire);
    let room_id = payload.get("roomId").and_then(Value::as_str);
    let candidates = match (room_type, room_id) {
        (Some(RoomType::Address), _) => vec![RoomKey::address(sender.address.clone())],
        (Some(kind), Some(id)) => vec![RoomKey {
            kind,
            id: id.to_string(),
        }],
        // No usable room type: the id names a secret or a public room
        (None, Some(id)) => vec![RoomKey::secret(id), RoomKey::public(id)],
        (_, None) => {
            debug!("Dropping relay from {}: no room id", sender_id);
            return false;
        }
    };

    // Both ends must share the room; a missing recipient most likely just left
    let Some(room) = candidates
        .iter()
        .find(|room| registry.is_member(room, sender_id) && registry.is_member(room, &to))
    else {
        debug!("Dropping relay from {} to {}: no shared room", sender_id, to);
        return false;
    };
    debug!("Relaying from {} to {} in {}", sender_id, to, room);
    let Some(recipient) = registry.peer(&to) else {
        return false;
    };

    payload.remove("to");
    payload.insert(
        "sender".to_string(),
        serde_json::to_value(sender.stamp()).unwrap_or(Value::Null),
    );
    recipient.send_outbound(Outbound::Relay(payload));
    true
}
