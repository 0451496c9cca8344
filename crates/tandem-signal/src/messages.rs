//! Signal protocol messages
//!
//! Every frame is a JSON object with a `type` discriminator. Control
//! messages decode into [`ClientMessage`] variants with typed payloads and
//! reject unknown fields; `signal` frames (and, with fallback enabled, any
//! unrecognized type) stay as raw JSON maps so they can be relayed without
//! the server looking inside.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::identity::PeerName;

/// Raw JSON object carried by relayed messages
pub type Payload = Map<String, Value>;

/// Room namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    /// Peers sharing a normalized network address
    Address,
    /// Peers sharing a long client-held token
    Secret,
    /// Peers who joined a short public code
    Public,
}

impl RoomType {
    /// Parse the wire name of a namespace
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "address" => Some(Self::Address),
            "secret" => Some(Self::Secret),
            "public" => Some(Self::Public),
            _ => None,
        }
    }
}

/// Public view of a peer, as shown to other room members
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub id: String,
    pub name: PeerName,
    pub rtc_capable: bool,
}

/// Sender identity stamped onto relayed messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderStamp {
    pub id: String,
    pub rtc_capable: bool,
}

/// Capability configuration handed to a client on connect
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// RTCPeerConnection configuration (ICE servers etc.)
    pub rtc_config: Value,
    /// Whether the server relays unknown message types
    pub ws_fallback: bool,
}

/// Messages sent from the server to a client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Identity assigned on connect
    #[serde(rename_all = "camelCase")]
    IdentityAssigned {
        peer_id: String,
        /// Present this with `peer_id` when reconnecting to keep the same id
        peer_id_hash: String,
        display_name: String,
        device_name: String,
        config: ClientConfig,
    },

    /// Heartbeat probe, answered with `pong`
    Ping,

    /// Snapshot of the other members, sent to a peer joining a room
    #[serde(rename_all = "camelCase")]
    Peers {
        peers: Vec<PeerDescriptor>,
        room_type: RoomType,
        room_id: String,
    },

    /// A peer joined a room this client is in
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer: PeerDescriptor,
        room_type: RoomType,
        room_id: String,
    },

    /// A peer left a room this client is in
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: String,
        room_type: RoomType,
        room_id: String,
        /// `true` when the peer is gone, `false` when it is only renegotiating
        is_disconnect: bool,
    },

    /// Pairing code issued to its creator
    #[serde(rename_all = "camelCase")]
    PairingTicketIssued { code: String, room_secret: String },

    /// Pairing completed, sent to both sides naming the other
    #[serde(rename_all = "camelCase")]
    PairingJoined { peer_id: String, room_secret: String },

    /// Unknown code, or the creator tried to redeem its own code
    PairingInvalid { code: String },

    /// The creator's outstanding code was withdrawn
    PairingCanceled { code: String },

    /// Too many guarded requests, try again later
    PairingRateLimited,

    /// A secret room was torn down
    #[serde(rename_all = "camelCase")]
    SecretRoomDeleted { room_secret: String },

    /// A secret room's token was replaced
    SecretRoomTokenRegenerated { old: String, new: String },

    #[serde(rename_all = "camelCase")]
    PublicRoomCreated { room_id: String },

    #[serde(rename_all = "camelCase")]
    PublicRoomInvalid { room_id: String },

    PublicRoomLeft,
}

impl ServerMessage {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Items queued for a connection's writer task
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Typed server message
    Message(ServerMessage),
    /// Relayed peer payload, forwarded as-is
    Relay(Payload),
    /// Close the socket
    Close,
}

impl Outbound {
    /// Encode as a text frame; `None` for `Close`
    pub fn to_json(&self) -> Result<Option<String>, serde_json::Error> {
        match self {
            Outbound::Message(msg) => msg.to_json().map(Some),
            Outbound::Relay(payload) => serde_json::to_string(payload).map(Some),
            Outbound::Close => Ok(None),
        }
    }
}

impl From<ServerMessage> for Outbound {
    fn from(msg: ServerMessage) -> Self {
        Outbound::Message(msg)
    }
}

/// Messages received from a client
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// Leave everything and close
    Disconnect,
    /// Heartbeat acknowledgment
    Pong,
    /// (Re)join the address room
    JoinAddressRoom,
    /// Join secret rooms in bulk
    RoomSecrets { room_secrets: Vec<String> },
    /// Tear down secret rooms in bulk
    RoomSecretsDeleted { room_secrets: Vec<String> },
    PairDeviceInitiate,
    PairDeviceJoin { code: String },
    PairDeviceCancel,
    RegenerateRoomSecret { room_secret: String },
    CreatePublicRoom,
    JoinPublicRoom { room_id: String, create_if_missing: bool },
    LeavePublicRoom,
    /// Signaling envelope for one peer (`to`, `roomType`, `roomId`, anything else)
    Signal(Payload),
    /// Unrecognized type, relayed only in fallback mode
    Fallback(Payload),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Empty {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RoomSecretsBody {
    room_secrets: Vec<Value>,
}

impl RoomSecretsBody {
    /// String entries only; the caller validates each token on its own
    fn into_strings(self) -> Vec<String> {
        self.room_secrets
            .into_iter()
            .filter_map(|entry| match entry {
                Value::String(secret) => Some(secret),
                _ => None,
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RoomSecretBody {
    room_secret: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CodeBody {
    code: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct JoinPublicRoomBody {
    room_id: String,
    #[serde(default)]
    create_if_missing: bool,
}

fn body<T: DeserializeOwned>(kind: &str, fields: Payload) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(fields)).map_err(|source| ProtocolError::Payload {
        kind: kind.to_string(),
        source,
    })
}

impl ClientMessage {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let Value::Object(mut fields) = serde_json::from_str::<Value>(json)? else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        if kind == "signal" {
            return Ok(Self::Signal(fields));
        }

        let is_control = matches!(
            kind.as_str(),
            "disconnect"
                | "pong"
                | "join-address-room"
                | "room-secrets"
                | "room-secrets-deleted"
                | "pair-device-initiate"
                | "pair-device-join"
                | "pair-device-cancel"
                | "regenerate-room-secret"
                | "create-public-room"
                | "join-public-room"
                | "leave-public-room"
        );
        if !is_control {
            return Ok(Self::Fallback(fields));
        }

        fields.remove("type");
        let kind = kind.as_str();
        let msg = match kind {
            "room-secrets" => {
                let b: RoomSecretsBody = body(kind, fields)?;
                Self::RoomSecrets {
                    room_secrets: b.into_strings(),
                }
            }
            "room-secrets-deleted" => {
                let b: RoomSecretsBody = body(kind, fields)?;
                Self::RoomSecretsDeleted {
                    room_secrets: b.into_strings(),
                }
            }
            "pair-device-join" => {
                let b: CodeBody = body(kind, fields)?;
                Self::PairDeviceJoin { code: b.code }
            }
            "regenerate-room-secret" => {
                let b: RoomSecretBody = body(kind, fields)?;
                Self::RegenerateRoomSecret {
                    room_secret: b.room_secret,
                }
            }
            "join-public-room" => {
                let b: JoinPublicRoomBody = body(kind, fields)?;
                Self::JoinPublicRoom {
                    room_id: b.room_id,
                    create_if_missing: b.create_if_missing,
                }
            }
            _ => {
                let Empty {} = body(kind, fields)?;
                match kind {
                    "disconnect" => Self::Disconnect,
                    "pong" => Self::Pong,
                    "join-address-room" => Self::JoinAddressRoom,
                    "pair-device-initiate" => Self::PairDeviceInitiate,
                    "pair-device-cancel" => Self::PairDeviceCancel,
                    "create-public-room" => Self::CreatePublicRoom,
                    _ => Self::LeavePublicRoom,
                }
            }
        };
        Ok(msg)
    }
}
