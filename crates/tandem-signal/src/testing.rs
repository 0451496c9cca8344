//! Test helpers shared by unit tests

use tokio::sync::mpsc;

use crate::identity::{peer_name, ResolvedIdentity};
use crate::messages::{Outbound, ServerMessage};
use crate::peer::PeerRecord;
use crate::rate_limit::RateLimiter;

pub fn identity(id: &str, address: &str) -> ResolvedIdentity {
    ResolvedIdentity {
        id: id.into(),
        id_hash: format!("hash-{}", id),
        address: address.into(),
        rtc_capable: true,
        name: peer_name(id, None),
    }
}

pub fn make_peer(id: &str, address: &str) -> (PeerRecord, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = PeerRecord::new(identity(id, address), 1, RateLimiter::default(), tx);
    (peer, rx)
}

/// Everything queued so far
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Typed messages queued so far, skipping relays and close markers
pub fn drain_messages(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
    drain(rx)
        .into_iter()
        .filter_map(|item| match item {
            Outbound::Message(msg) => Some(msg),
            _ => None,
        })
        .collect()
}

pub fn secret(c: char) -> String {
    c.to_string().repeat(64)
}
