//! # myrtle-protocol
//!
//! Sans-I/O pieces of the MySQL/MariaDB client/server protocol.
//!
//! This crate provides:
//! - Frame headers, frame sealing and sequence-number bookkeeping
//! - The reusable `Packet` buffer with bounds-checked readers
//! - Compressed-packet headers and zlib payload handling
//! - Initial handshake parsing and client handshake builders
//! - Error-envelope decoding and protocol constants
//!
//! Everything that touches a socket lives in `myrtle-client`.

pub mod compress;
pub mod consts;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod packet;
pub mod response;
pub mod state;

pub use compress::{CompressedHeader, COMPRESSED_HEADER_SIZE, DEFAULT_COMPRESSION_THRESHOLD};
pub use consts::{CapabilityFlags, Command, StatusFlags, TextEncoding};
pub use error::{decode_error, ProtocolError, ServerError};
pub use frame::{begin_frame, seal_frame, FrameHeader, FRAME_HEADER_SIZE};
pub use handshake::{AuthSwitch, Capabilities, HandshakeResponse, ServerVersion, SslRequest};
pub use packet::{Packet, PacketBuffers};
pub use response::{OkPacket, ResponseKind};
pub use state::ConnectionState;

/// Protocol version sent by every server this crate understands.
pub const PROTOCOL_VERSION: u8 = 10;

/// Default server port.
pub const DEFAULT_PORT: u16 = 3306;

/// Largest payload a single frame can carry (16 MiB - 1).
///
/// A frame of exactly this length is followed by a continuation frame.
pub const MAX_PACKET_LENGTH: usize = 0xFF_FFFF;

/// Default limit on a reassembled inbound message and on outbound packets.
pub const DEFAULT_MAX_ALLOWED_PACKET: usize = 16 * 1024 * 1024;

/// Marker byte of an error response.
pub const ERROR_MARKER: u8 = 0xFF;

/// Marker byte of an OK response.
pub const OK_MARKER: u8 = 0x00;

/// Marker byte of an EOF response (also used for auth switch requests).
pub const EOF_MARKER: u8 = 0xFE;
