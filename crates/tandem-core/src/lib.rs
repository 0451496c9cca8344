//! Tandem Core - Shared configuration, error types and cryptographic helpers
//!
//! This crate contains the pieces of the signaling server that have no
//! dependency on networking: the TOML configuration model, random code and
//! secret generation, and the keyed identity hash used for peer resumption.

pub mod config;
pub mod crypto;
pub mod error;

pub use config::{Config, SignalConfig};
pub use crypto::IdentityKey;
pub use error::ConfigError;
