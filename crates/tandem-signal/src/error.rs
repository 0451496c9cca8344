//! Error types for the signal server

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use tandem_core::ConfigError;

/// Errors that end a connection or stop the server
#[derive(Error, Debug)]
pub enum SignalError {
    /// Underlying I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Outbound message could not be encoded
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// System random number generator failed
    #[error("random number generator failed: {0}")]
    Rng(#[from] getrandom::Error),
}

/// Malformed inbound frames. These are logged and dropped; the connection stays open.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
