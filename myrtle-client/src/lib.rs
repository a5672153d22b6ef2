//! # myrtle-client
//!
//! Async client side of the MySQL/MariaDB wire protocol.
//!
//! This crate provides:
//! - Packet framing with multi-packet reassembly and sequence checking
//! - Optional compressed framing
//! - Greeting parsing, TLS upgrade and login
//! - Command dispatch with error-envelope decoding
//! - YAML/env configuration and frame tracing for diagnostics
//!
//! Result-set decoding and authentication-plugin cryptography are left to
//! the caller.

pub mod auth;
pub mod codec;
pub mod compressed;
pub mod config;
pub mod connection;
pub mod error;
pub mod negotiate;
pub mod socket;
pub mod stream;
pub mod tls;
pub mod trace;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{AuthPlugin, AuthRegistry, ClearPassword};
pub use codec::FrameCodec;
pub use config::{ConfigError, ConnectionConfig, TlsClientConfig};
pub use connection::{CommandRequest, Connection, Interrupt, InterruptHandle};
pub use error::ClientError;
pub use negotiate::NegotiationState;
pub use stream::ClientStream;
pub use trace::{Direction, FrameTrace};
pub use transport::{PacketChannel, Transport};
