//! Per-connection peer state

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::identity::{PeerName, ResolvedIdentity};
use crate::messages::{Outbound, PeerDescriptor, SenderStamp, ServerMessage};
use crate::rate_limit::RateLimiter;

/// Peer identifier (UUID string)
pub type PeerId = String;

/// Sending half of a connection's outbound queue
pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

/// A connected peer, stored once in the registry's peer table
///
/// Rooms refer to peers by id only; membership fields here mirror the
/// room table so teardown can find every room a peer is in.
#[derive(Debug)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Normalized address, also the id of the peer's address room
    pub address: String,
    pub rtc_capable: bool,
    pub name: PeerName,
    /// Generation of the socket that owns this record
    pub connection: u64,
    pub secret_rooms: HashSet<String>,
    pub public_room: Option<String>,
    pub rate: RateLimiter,
    tx: OutboundTx,
}

impl PeerRecord {
    pub fn new(identity: ResolvedIdentity, connection: u64, rate: RateLimiter, tx: OutboundTx) -> Self {
        Self {
            id: identity.id,
            address: identity.address,
            rtc_capable: identity.rtc_capable,
            name: identity.name,
            connection,
            secret_rooms: HashSet::new(),
            public_room: None,
            rate,
            tx,
        }
    }

    /// Public view shared with other members
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            rtc_capable: self.rtc_capable,
        }
    }

    /// Sender identity stamped onto relayed messages
    pub fn stamp(&self) -> SenderStamp {
        SenderStamp {
            id: self.id.clone(),
            rtc_capable: self.rtc_capable,
        }
    }

    /// Queue a message; a closed connection silently drops it
    pub fn send(&self, msg: ServerMessage) {
        self.send_outbound(Outbound::Message(msg));
    }

    pub fn send_outbound(&self, item: Outbound) {
        let _ = self.tx.send(item);
    }

    /// Ask the connection's writer to close the socket
    pub fn close(&self) {
        self.send_outbound(Outbound::Close);
    }
}
