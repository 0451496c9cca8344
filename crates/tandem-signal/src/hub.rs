//! Connection lifecycle controller
//!
//! The hub owns the room registry and the ticket store behind one mutex,
//! so every join, leave and ticket change is applied in a single order.
//! Messages to peers are pushed onto unbounded per-connection queues while
//! the lock is held, which keeps per-recipient ordering intact and never
//! blocks. Slow readers are not pushed back on; their queues just grow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tandem_core::crypto::{
    try_generate_pairing_code, try_generate_public_room_id, try_generate_room_secret,
    validate_room_secret,
};
use tandem_core::SignalConfig;

use crate::error::ProtocolError;
use crate::heartbeat::{Liveness, LivenessMonitor};
use crate::identity::ResolvedIdentity;
use crate::messages::{ClientConfig, ClientMessage, ServerMessage};
use crate::pairing::{self, MemoryBroker, TicketBroker};
use crate::peer::{OutboundTx, PeerRecord};
use crate::public_room;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::registry::{MemoryRegistry, RoomKey, RoomRegistry};
use crate::relay;

/// Settings the hub needs at runtime
#[derive(Clone, Debug)]
pub struct HubSettings {
    pub ws_fallback: bool,
    pub rtc_config: Value,
    pub rate_limit: RateLimitConfig,
    pub heartbeat_interval: std::time::Duration,
    pub heartbeat_max_missed: u32,
}

impl HubSettings {
    pub fn from_config(config: &SignalConfig, rtc_config: Value) -> Self {
        Self {
            ws_fallback: config.ws_fallback,
            rtc_config,
            rate_limit: RateLimitConfig::from(config),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_max_missed: config.heartbeat_max_missed,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from_config(&SignalConfig::default(), tandem_core::config::default_rtc_config())
    }
}

/// Registry and ticket store, always locked together
pub struct Stores {
    pub registry: Box<dyn RoomRegistry>,
    pub tickets: Box<dyn TicketBroker>,
}

/// Handle identifying one connection of one peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub peer_id: String,
    pub connection: u64,
}

/// Shared server state
pub struct Hub {
    settings: HubSettings,
    stores: Mutex<Stores>,
    liveness: LivenessMonitor,
    next_connection: AtomicU64,
    this: Weak<Hub>,
}

impl Hub {
    /// Hub with in-memory stores
    pub fn new(settings: HubSettings) -> Arc<Self> {
        Self::with_stores(
            settings,
            Box::new(MemoryRegistry::new()),
            Box::new(MemoryBroker::new()),
        )
    }

    /// Hub with caller-provided stores
    pub fn with_stores(
        settings: HubSettings,
        registry: Box<dyn RoomRegistry>,
        tickets: Box<dyn TicketBroker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            liveness: LivenessMonitor::new(settings.heartbeat_interval, settings.heartbeat_max_missed),
            settings,
            stores: Mutex::new(Stores { registry, tickets }),
            next_connection: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Register a new connection
    ///
    /// Sends `identity-assigned`, joins the address room and starts the
    /// heartbeat. A resumed id still held by an older socket takes over:
    /// the old connection is torn down and closed first.
    pub fn connect(&self, identity: ResolvedIdentity, tx: OutboundTx) -> Session {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            peer_id: identity.id.clone(),
            connection,
        };

        {
            let mut stores = self.stores.lock();
            let stale = stores.registry.peer(&session.peer_id).map(|p| p.connection);
            if let Some(stale) = stale {
                info!("Peer {} reconnected, closing previous connection", session.peer_id);
                self.teardown(&mut stores, &session.peer_id, stale);
            }

            let peer = PeerRecord::new(
                identity.clone(),
                connection,
                RateLimiter::new(self.settings.rate_limit),
                tx,
            );
            peer.send(ServerMessage::IdentityAssigned {
                peer_id: identity.id.clone(),
                peer_id_hash: identity.id_hash,
                display_name: identity.name.display_name.clone(),
                device_name: identity.name.device_name.clone(),
                config: ClientConfig {
                    rtc_config: self.settings.rtc_config.clone(),
                    ws_fallback: self.settings.ws_fallback,
                },
            });
            stores.registry.insert_peer(peer);
            stores
                .registry
                .join(&session.peer_id, &RoomKey::address(identity.address.as_str()));

            let hub = self.this.clone();
            let tick_session = session.clone();
            self.liveness.start(&session.peer_id, connection, move |event| {
                if let Some(hub) = hub.upgrade() {
                    hub.on_liveness(&tick_session, event);
                }
            });
        }

        info!(
            "Peer {} connected from {} ({})",
            session.peer_id, identity.address, identity.name.device_name
        );
        session
    }

    fn on_liveness(&self, session: &Session, event: Liveness) {
        match event {
            Liveness::Probe => {
                let stores = self.stores.lock();
                if let Some(peer) = stores.registry.peer(&session.peer_id) {
                    if peer.connection == session.connection {
                        peer.send(ServerMessage::Ping);
                    }
                }
            }
            Liveness::Expired => {
                if self.disconnect(session) {
                    info!("Peer {} evicted (heartbeat timeout)", session.peer_id);
                }
            }
        }
    }

    /// Tear a connection down: withdraw its pairing code, stop its
    /// heartbeat, leave every room and close the socket.
    ///
    /// Safe to call any number of times and from any task; only the first
    /// call for the current connection does anything.
    pub fn disconnect(&self, session: &Session) -> bool {
        let mut stores = self.stores.lock();
        let current = stores
            .registry
            .peer(&session.peer_id)
            .is_some_and(|p| p.connection == session.connection);
        if !current {
            self.liveness.stop(&session.peer_id, session.connection);
            return false;
        }
        self.teardown(&mut stores, &session.peer_id, session.connection);
        info!("Peer {} disconnected", session.peer_id);
        true
    }

    fn teardown(&self, stores: &mut MutexGuard<'_, Stores>, peer_id: &str, connection: u64) {
        if let Some(ticket) = stores.tickets.take_owned_by(peer_id) {
            debug!("Pairing code {} dropped (creator left)", ticket.code);
        }
        self.liveness.stop(peer_id, connection);
        stores.registry.leave_all(peer_id, true);
        if let Some(peer) = stores.registry.remove_peer(peer_id) {
            peer.close();
        }
    }

    /// Decode and dispatch one text frame. Malformed frames are dropped.
    pub fn handle_text(&self, session: &Session, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => self.dispatch(session, msg),
            Err(e) => self.drop_malformed(session, e),
        }
    }

    fn drop_malformed(&self, session: &Session, error: ProtocolError) {
        debug!("Dropping frame from {}: {}", session.peer_id, error);
    }

    /// Lock the stores if `session` still owns its peer record
    fn lock_current(&self, session: &Session) -> Option<MutexGuard<'_, Stores>> {
        let stores = self.stores.lock();
        let current = stores
            .registry
            .peer(&session.peer_id)
            .is_some_and(|p| p.connection == session.connection);
        current.then_some(stores)
    }

    /// Dispatch one decoded message
    pub fn dispatch(&self, session: &Session, msg: ClientMessage) {
        let peer_id = session.peer_id.as_str();
        match msg {
            ClientMessage::Disconnect => {
                self.disconnect(session);
            }
            ClientMessage::Pong => self.liveness.ack(peer_id, session.connection),
            other => {
                let Some(mut stores) = self.lock_current(session) else {
                    debug!("Dropping message from stale connection of {}", peer_id);
                    return;
                };
                let Stores { registry, tickets } = &mut *stores;
                self.apply(registry.as_mut(), tickets.as_mut(), peer_id, other);
            }
        }
    }

    fn apply(
        &self,
        registry: &mut dyn RoomRegistry,
        tickets: &mut dyn TicketBroker,
        peer_id: &str,
        msg: ClientMessage,
    ) {
        match msg {
            ClientMessage::Disconnect | ClientMessage::Pong => {}
            ClientMessage::JoinAddressRoom => {
                if let Some(address) = registry.peer(peer_id).map(|p| p.address.clone()) {
                    registry.join(peer_id, &RoomKey::address(address));
                }
            }
            ClientMessage::RoomSecrets { room_secrets } => {
                for secret in room_secrets {
                    if validate_room_secret(&secret) {
                        registry.join(peer_id, &RoomKey::secret(secret));
                    } else {
                        debug!("Ignoring malformed room secret from {}", peer_id);
                    }
                }
            }
            ClientMessage::RoomSecretsDeleted { room_secrets } => {
                for secret in room_secrets.into_iter().filter(|s| validate_room_secret(s)) {
                    let members = registry.delete_room(&RoomKey::secret(secret.as_str()));
                    for member in &members {
                        registry.send_to(
                            member,
                            ServerMessage::SecretRoomDeleted {
                                room_secret: secret.clone(),
                            },
                        );
                    }
                    if !members.is_empty() {
                        info!("Secret room deleted by {} ({} members)", peer_id, members.len());
                    }
                }
            }
            ClientMessage::PairDeviceInitiate => {
                let fresh = try_generate_room_secret().and_then(|secret| {
                    pairing::draw_code(&*tickets, try_generate_pairing_code).map(|code| (code, secret))
                });
                match fresh {
                    Ok((code, secret)) => {
                        pairing::initiate(registry, tickets, peer_id, code, secret);
                    }
                    Err(e) => warn!("Cannot issue pairing code for {}: {}", peer_id, e),
                }
            }
            ClientMessage::PairDeviceJoin { code } => {
                pairing::redeem(registry, tickets, peer_id, &code, Instant::now());
            }
            ClientMessage::PairDeviceCancel => {
                pairing::cancel(registry, tickets, peer_id);
            }
            ClientMessage::RegenerateRoomSecret { room_secret } => match try_generate_room_secret() {
                Ok(new) => {
                    pairing::regenerate_room_secret(registry, peer_id, &room_secret, new);
                }
                Err(e) => warn!("Cannot regenerate room secret for {}: {}", peer_id, e),
            },
            ClientMessage::CreatePublicRoom => {
                if let Err(e) = public_room::create(registry, peer_id, try_generate_public_room_id) {
                    warn!("Cannot create public room for {}: {}", peer_id, e);
                }
            }
            ClientMessage::JoinPublicRoom {
                room_id,
                create_if_missing,
            } => {
                public_room::join(registry, peer_id, &room_id, create_if_missing, Instant::now());
            }
            ClientMessage::LeavePublicRoom => public_room::leave(registry, peer_id),
            ClientMessage::Signal(payload) => {
                relay::relay(registry, peer_id, payload);
            }
            ClientMessage::Fallback(payload) => {
                if self.settings.ws_fallback {
                    relay::relay(registry, peer_id, payload);
                } else {
                    debug!(
                        "Dropping unknown message type {:?} from {} (fallback disabled)",
                        payload.get("type"),
                        peer_id
                    );
                }
            }
        }
    }

    /// Number of rooms across all namespaces
    pub fn room_count(&self) -> usize {
        self.stores.lock().registry.room_count()
    }

    /// Number of connected peers
    pub fn peer_count(&self) -> usize {
        self.stores.lock().registry.peer_count()
    }

    /// Number of outstanding pairing codes
    pub fn ticket_count(&self) -> usize {
        self.stores.lock().tickets.len()
    }

    /// Whether a room currently exists
    pub fn room_exists(&self, room: &RoomKey) -> bool {
        self.stores.lock().registry.contains_room(room)
    }

    /// Members of a room in registry order
    pub fn room_members(&self, room: &RoomKey) -> Vec<String> {
        self.stores.lock().registry.members(room)
    }

    /// Number of connections with a running heartbeat
    pub fn monitored_count(&self) -> usize {
        self.liveness.len()
    }
}
