//! Initial handshake parsing and the client's handshake replies.

use crate::consts::{CapabilityFlags, StatusFlags};
use crate::error::ProtocolError;
use crate::packet::{put_lenenc_int, put_null_terminated, Packet};
use crate::{EOF_MARKER, PROTOCOL_VERSION};
use bytes::{BufMut, BytesMut};
use serde::Serialize;
use std::fmt;

/// Length of the first scramble part in the greeting.
pub const SEED_LENGTH: usize = 8;

/// Fixed part shared by the SSL request and the handshake response.
pub const SSL_REQUEST_LENGTH: usize = 32;

/// Prefix MariaDB puts in front of its real version for old replicas.
const MARIADB_RPL_HACK_PREFIX: &str = "5.5.5-";

/// `major.minor.patch` parsed from the server's version banner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses the leading numeric triple of a banner such as
    /// `8.0.36-0ubuntu0.22.04.1`. Anything unparseable yields `0.0.0`.
    pub fn parse(banner: &str) -> Self {
        let banner = banner
            .strip_prefix(MARIADB_RPL_HACK_PREFIX)
            .unwrap_or(banner);

        let mut parts = banner.splitn(3, '.').map(leading_number);
        let Some(Some(major)) = parts.next() else {
            return Self::default();
        };
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Self::new(major, minor, patch)
    }

    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        *self >= Self::new(major, minor, patch)
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let end = part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(part.len());
    part[..end].parse().ok()
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the server announced in its initial handshake.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub protocol_version: u8,
    pub server_version: ServerVersion,
    /// The version banner exactly as sent.
    pub server_version_raw: String,
    pub thread_id: u32,
    #[serde(skip)]
    pub seed: [u8; SEED_LENGTH],
    /// Second scramble part, trailing NUL removed.
    #[serde(skip)]
    pub seed_ext: Vec<u8>,
    pub flags: CapabilityFlags,
    pub charset: u8,
    pub status: StatusFlags,
    pub auth_plugin_data_len: Option<u8>,
    pub auth_plugin: Option<String>,
}

impl Capabilities {
    /// Parses a protocol-10 greeting.
    pub fn parse(packet: &mut Packet) -> Result<Self, ProtocolError> {
        let protocol_version = packet.read_u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(protocol_version));
        }

        let server_version_raw = String::from_utf8_lossy(packet.read_null_terminated()).into_owned();
        let server_version = ServerVersion::parse(&server_version_raw);
        let thread_id = packet.read_u32_le()?;

        let mut seed = [0u8; SEED_LENGTH];
        seed.copy_from_slice(packet.read_bytes(SEED_LENGTH)?);
        packet.skip(1)?;

        // Very old servers stop after the filler or after the lower
        // capability half.
        let low = match packet.remaining() {
            0 => 0,
            _ => packet.read_u16_le()? as u32,
        };
        if packet.remaining() == 0 {
            return Ok(Self {
                protocol_version,
                server_version,
                server_version_raw,
                thread_id,
                seed,
                seed_ext: Vec::new(),
                flags: CapabilityFlags::new(low),
                charset: 0,
                status: StatusFlags::default(),
                auth_plugin_data_len: None,
                auth_plugin: None,
            });
        }

        let charset = packet.read_u8()?;
        let status = StatusFlags::new(packet.read_u16_le()?);
        let high = packet.read_u16_le()? as u32;
        let flags = CapabilityFlags::new(low | (high << 16));

        let auth_plugin_data_len = if flags.contains(CapabilityFlags::PLUGIN_AUTH) {
            Some(packet.read_u8()?)
        } else {
            packet.skip(1)?;
            None
        };
        packet.skip(10)?;

        let mut seed_ext = Vec::new();
        if flags.contains(CapabilityFlags::SECURE_CONNECTION) {
            let declared = auth_plugin_data_len.unwrap_or(0) as usize;
            let len = declared.saturating_sub(SEED_LENGTH).max(13);
            let part = packet.read_bytes(len.min(packet.remaining()))?;
            let part = part.strip_suffix(&[0]).unwrap_or(part);
            seed_ext.extend_from_slice(part);
        }

        let auth_plugin = if flags.contains(CapabilityFlags::PLUGIN_AUTH) && packet.remaining() > 0 {
            Some(String::from_utf8_lossy(packet.read_null_terminated()).into_owned())
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            server_version,
            server_version_raw,
            thread_id,
            seed,
            seed_ext,
            flags,
            charset,
            status,
            auth_plugin_data_len,
            auth_plugin,
        })
    }

    /// Writes this greeting in protocol-10 layout.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol_version);
        put_null_terminated(buf, self.server_version_raw.as_bytes());
        buf.put_u32_le(self.thread_id);
        buf.put_slice(&self.seed);
        buf.put_u8(0);
        buf.put_u16_le(self.flags.bits() as u16);
        buf.put_u8(self.charset);
        buf.put_u16_le(self.status.bits());
        buf.put_u16_le((self.flags.bits() >> 16) as u16);
        if self.flags.contains(CapabilityFlags::PLUGIN_AUTH) {
            buf.put_u8((SEED_LENGTH + self.seed_ext.len() + 1) as u8);
        } else {
            buf.put_u8(0);
        }
        buf.put_slice(&[0u8; 10]);
        if self.flags.contains(CapabilityFlags::SECURE_CONNECTION) {
            put_null_terminated(buf, &self.seed_ext);
        }
        if self.flags.contains(CapabilityFlags::PLUGIN_AUTH) {
            if let Some(plugin) = &self.auth_plugin {
                put_null_terminated(buf, plugin.as_bytes());
            }
        }
    }

    pub fn supports(&self, flag: u32) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version_raw.contains("MariaDB")
    }

    /// Full authentication seed (both scramble parts).
    pub fn scramble(&self) -> Vec<u8> {
        let mut scramble = Vec::with_capacity(SEED_LENGTH + self.seed_ext.len());
        scramble.extend_from_slice(&self.seed);
        scramble.extend_from_slice(&self.seed_ext);
        scramble
    }

    pub fn set_status(&mut self, status: StatusFlags) {
        self.status = status;
    }

    /// Flags the client will announce, masked by what the server offers.
    pub fn client_flags(&self, with_database: bool, compress: bool, tls: bool) -> CapabilityFlags {
        let mut flags = CapabilityFlags::default()
            .with(CapabilityFlags::LONG_PASSWORD)
            .with(CapabilityFlags::LONG_FLAG)
            .with(CapabilityFlags::PROTOCOL_41)
            .with(CapabilityFlags::TRANSACTIONS)
            .with(CapabilityFlags::SECURE_CONNECTION)
            .with(CapabilityFlags::MULTI_RESULTS)
            .with(CapabilityFlags::PS_MULTI_RESULTS)
            .with(CapabilityFlags::PLUGIN_AUTH)
            .with(CapabilityFlags::PLUGIN_AUTH_LENENC_CLIENT_DATA);
        if with_database {
            flags = flags.with(CapabilityFlags::CONNECT_WITH_DB);
        }
        if compress {
            flags = flags.with(CapabilityFlags::COMPRESS);
        }
        if tls {
            flags = flags.with(CapabilityFlags::SSL);
        }
        flags.intersect(self.flags)
    }
}

/// The short packet asking the server to switch to TLS.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest {
    pub flags: CapabilityFlags,
    pub max_packet: u32,
    pub charset: u8,
}

impl SslRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_fixed_header(buf, self.flags.with(CapabilityFlags::SSL), self.max_packet, self.charset);
    }
}

fn put_fixed_header(buf: &mut BytesMut, flags: CapabilityFlags, max_packet: u32, charset: u8) {
    buf.put_u32_le(flags.bits());
    buf.put_u32_le(max_packet);
    buf.put_u8(charset);
    buf.put_slice(&[0u8; 23]);
}

/// Protocol-41 handshake response carrying the login.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub flags: CapabilityFlags,
    pub max_packet: u32,
    pub charset: u8,
    pub user: &'a [u8],
    pub auth_response: &'a [u8],
    pub database: Option<&'a [u8]>,
    pub auth_plugin: Option<&'a str>,
}

impl HandshakeResponse<'_> {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        put_fixed_header(buf, self.flags, self.max_packet, self.charset);
        put_null_terminated(buf, self.user);

        if self.flags.contains(CapabilityFlags::PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            put_lenenc_int(buf, self.auth_response.len() as u64);
            buf.put_slice(self.auth_response);
        } else if self.flags.contains(CapabilityFlags::SECURE_CONNECTION) {
            let len = u8::try_from(self.auth_response.len()).map_err(|_| {
                ProtocolError::Malformed(format!(
                    "auth response of {} bytes needs length-encoded client data",
                    self.auth_response.len()
                ))
            })?;
            buf.put_u8(len);
            buf.put_slice(self.auth_response);
        } else {
            put_null_terminated(buf, self.auth_response);
        }

        if self.flags.contains(CapabilityFlags::CONNECT_WITH_DB) {
            put_null_terminated(buf, self.database.unwrap_or_default());
        }
        if self.flags.contains(CapabilityFlags::PLUGIN_AUTH) {
            put_null_terminated(buf, self.auth_plugin.unwrap_or_default().as_bytes());
        }
        Ok(())
    }
}

/// Server request to restart authentication with another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitch {
    pub plugin: String,
    pub data: Vec<u8>,
}

impl AuthSwitch {
    pub fn parse(packet: &mut Packet) -> Result<Self, ProtocolError> {
        let marker = packet.read_u8()?;
        if marker != EOF_MARKER {
            return Err(ProtocolError::Malformed(format!(
                "auth switch marker 0x{marker:02x}"
            )));
        }
        let plugin = String::from_utf8_lossy(packet.read_null_terminated()).into_owned();
        let data = packet.read_rest();
        let data = data.strip_suffix(&[0]).unwrap_or(data).to_vec();
        Ok(Self { plugin, data })
    }
}
