//! Pairing-key broker
//!
//! Two devices pair by exchanging a short numeric code:
//!
//! 1. The creator asks for a code; the server generates a long room secret,
//!    files a ticket `code -> secret` and puts the creator in that secret room
//! 2. The joiner submits the code; the ticket is consumed, both sides learn
//!    the secret and each other's id, and the joiner enters the room
//!
//! A ticket ends exactly once: redeemed, canceled, replaced by a newer
//! ticket from the same creator, or dropped when the creator disconnects.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, info};

use tandem_core::crypto::{validate_pairing_code, validate_room_secret};

use crate::messages::ServerMessage;
use crate::peer::PeerId;
use crate::registry::{RoomKey, RoomRegistry};

/// Outstanding pairing code
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingTicket {
    pub code: String,
    pub room_secret: String,
    pub creator: PeerId,
}

/// Store of outstanding tickets, at most one per creator
pub trait TicketBroker: Send {
    fn contains(&self, code: &str) -> bool;

    fn get(&self, code: &str) -> Option<&PairingTicket>;

    /// File a ticket, returning the creator's previous ticket if it had one
    fn insert(&mut self, ticket: PairingTicket) -> Option<PairingTicket>;

    /// Remove a ticket by code
    fn take(&mut self, code: &str) -> Option<PairingTicket>;

    /// Remove the ticket owned by a creator
    fn take_owned_by(&mut self, creator: &str) -> Option<PairingTicket>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory ticket store
#[derive(Debug, Default)]
pub struct MemoryBroker {
    tickets: HashMap<String, PairingTicket>,
    owners: HashMap<PeerId, String>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TicketBroker for MemoryBroker {
    fn contains(&self, code: &str) -> bool {
        self.tickets.contains_key(code)
    }

    fn get(&self, code: &str) -> Option<&PairingTicket> {
        self.tickets.get(code)
    }

    fn insert(&mut self, ticket: PairingTicket) -> Option<PairingTicket> {
        let previous = self.take_owned_by(&ticket.creator);
        self.owners.insert(ticket.creator.clone(), ticket.code.clone());
        self.tickets.insert(ticket.code.clone(), ticket);
        previous
    }

    fn take(&mut self, code: &str) -> Option<PairingTicket> {
        let ticket = self.tickets.remove(code)?;
        self.owners.remove(&ticket.creator);
        Some(ticket)
    }

    fn take_owned_by(&mut self, creator: &str) -> Option<PairingTicket> {
        let code = self.owners.remove(creator)?;
        self.tickets.remove(&code)
    }

    fn len(&self) -> usize {
        self.tickets.len()
    }
}

/// Result of a `pair-device-join`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    Joined { creator: PeerId, room_secret: String },
    Invalid,
    RateLimited,
}

/// Draw a code not used by any outstanding ticket
pub fn draw_code<F>(broker: &dyn TicketBroker, mut generate: F) -> Result<String, getrandom::Error>
where
    F: FnMut() -> Result<String, getrandom::Error>,
{
    loop {
        let code = generate()?;
        if !broker.contains(&code) {
            return Ok(code);
        }
        debug!("Pairing code collision, drawing again");
    }
}

/// Issue a ticket for `creator` and put it in the new secret room
///
/// Any ticket the creator already held is withdrawn first.
pub fn initiate(
    registry: &mut dyn RoomRegistry,
    broker: &mut dyn TicketBroker,
    creator: &str,
    code: String,
    room_secret: String,
) -> Option<PairingTicket> {
    registry.peer(creator)?;

    let ticket = PairingTicket {
        code: code.clone(),
        room_secret: room_secret.clone(),
        creator: creator.to_string(),
    };
    if let Some(previous) = broker.insert(ticket.clone()) {
        debug!("Pairing code {} replaced by {}", previous.code, code);
    }

    registry.send_to(
        creator,
        ServerMessage::PairingTicketIssued {
            code: code.clone(),
            room_secret: room_secret.clone(),
        },
    );
    registry.join(creator, &RoomKey::secret(room_secret));

    info!("Pairing code {} issued to {}", code, creator);
    Some(ticket)
}

/// Redeem a code on behalf of `joiner`
pub fn redeem(
    registry: &mut dyn RoomRegistry,
    broker: &mut dyn TicketBroker,
    joiner: &str,
    code: &str,
    now: Instant,
) -> RedeemOutcome {
    let Some(peer) = registry.peer_mut(joiner) else {
        return RedeemOutcome::Invalid;
    };
    // Malformed codes can never match a ticket and cost no slot
    if !validate_pairing_code(code) {
        peer.send(ServerMessage::PairingInvalid {
            code: code.to_string(),
        });
        debug!("Peer {} sent malformed pairing code", joiner);
        return RedeemOutcome::Invalid;
    }
    if !peer.rate.try_acquire(now) {
        peer.send(ServerMessage::PairingRateLimited);
        debug!("Peer {} rate limited on pairing join", joiner);
        return RedeemOutcome::RateLimited;
    }

    let valid = broker.get(code).is_some_and(|t| t.creator != joiner);
    let ticket = match valid.then(|| broker.take(code)).flatten() {
        Some(ticket) => ticket,
        None => {
            registry.send_to(
                joiner,
                ServerMessage::PairingInvalid {
                    code: code.to_string(),
                },
            );
            debug!("Peer {} sent invalid pairing code {}", joiner, code);
            return RedeemOutcome::Invalid;
        }
    };

    registry.send_to(
        joiner,
        ServerMessage::PairingJoined {
            peer_id: ticket.creator.clone(),
            room_secret: ticket.room_secret.clone(),
        },
    );
    registry.send_to(
        &ticket.creator,
        ServerMessage::PairingJoined {
            peer_id: joiner.to_string(),
            room_secret: ticket.room_secret.clone(),
        },
    );
    registry.join(joiner, &RoomKey::secret(ticket.room_secret.clone()));

    // A peer is mid-pairing as creator or joiner, never both
    if let Some(own) = broker.take_owned_by(joiner) {
        debug!("Pairing code {} withdrawn, owner joined {}", own.code, code);
    }

    info!("Peer {} paired with {}", joiner, ticket.creator);
    RedeemOutcome::Joined {
        creator: ticket.creator,
        room_secret: ticket.room_secret,
    }
}

/// Withdraw the creator's outstanding ticket, if any
pub fn cancel(registry: &dyn RoomRegistry, broker: &mut dyn TicketBroker, creator: &str) -> bool {
    let Some(ticket) = broker.take_owned_by(creator) else {
        return false;
    };
    registry.send_to(creator, ServerMessage::PairingCanceled { code: ticket.code.clone() });
    debug!("Pairing code {} canceled by {}", ticket.code, creator);
    true
}

/// Replace a secret room's token on behalf of one of its members
///
/// Every member is told `{old, new}` and the room moves to the new token in
/// the same step, so nothing can be relayed against the old token afterward.
pub fn regenerate_room_secret(
    registry: &mut dyn RoomRegistry,
    requester: &str,
    old: &str,
    new: String,
) -> bool {
    if !validate_room_secret(old) || !registry.is_member(&RoomKey::secret(old), requester) {
        return false;
    }

    let members = registry.rekey_secret_room(old, &new);
    for member in &members {
        registry.send_to(
            member,
            ServerMessage::SecretRoomTokenRegenerated {
                old: old.to_string(),
                new: new.clone(),
            },
        );
    }
    info!("Secret room regenerated by {} ({} members)", requester, members.len());
    true
}
