//! Tandem Signal Server
//!
//! WebSocket signaling server that lets browsers on the same network, paired
//! devices, and peers sharing a short public code find each other and
//! exchange WebRTC session descriptions.
//!
//! # Protocol
//!
//! 1. A client connects and receives its identity and RTC configuration
//! 2. It is placed in the room for its network address automatically
//! 3. Secret rooms (paired devices) and public rooms are joined on request
//! 4. `signal` messages are relayed to a named peer in a shared room
//! 5. The server probes every client with `ping`; silent clients are evicted

pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod identity;
pub mod messages;
pub mod pairing;
pub mod peer;
pub mod public_room;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod server;

#[cfg(test)]
mod testing;

pub use error::{ProtocolError, SignalError};
pub use hub::{Hub, HubSettings, Session};
pub use identity::{ConnectionMeta, IdentityResolver, ResolvedIdentity};
pub use messages::{ClientMessage, Outbound, ServerMessage};
pub use pairing::{MemoryBroker, TicketBroker};
pub use registry::{MemoryRegistry, RoomKey, RoomRegistry};
pub use server::SignalServer;
