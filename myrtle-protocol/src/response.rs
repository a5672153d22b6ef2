//! Classification of command responses by their leading marker byte.

use crate::consts::StatusFlags;
use crate::error::ProtocolError;
use crate::packet::Packet;
use crate::{EOF_MARKER, ERROR_MARKER, OK_MARKER};
use serde::Serialize;

/// Marker byte of a LOCAL INFILE request.
pub const LOCAL_INFILE_MARKER: u8 = 0xFB;

/// EOF packets are always shorter than this; longer 0xFE packets are OKs.
const MAX_EOF_LENGTH: usize = 9;

/// Coarse shape of a response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseKind {
    Ok,
    Error,
    Eof,
    LocalInfile,
    ResultSet { columns: u64 },
}

impl ResponseKind {
    /// Classifies `packet` without moving its read position.
    pub fn classify(packet: &Packet) -> Result<Self, ProtocolError> {
        let marker = packet
            .peek_u8()
            .ok_or_else(|| ProtocolError::Malformed("empty response packet".to_string()))?;

        Ok(match marker {
            OK_MARKER => ResponseKind::Ok,
            ERROR_MARKER => ResponseKind::Error,
            EOF_MARKER if packet.len() < MAX_EOF_LENGTH => ResponseKind::Eof,
            EOF_MARKER => ResponseKind::Ok,
            LOCAL_INFILE_MARKER => ResponseKind::LocalInfile,
            _ => {
                let mut header = packet.clone();
                ResponseKind::ResultSet {
                    columns: header.read_lenenc_int()?,
                }
            }
        })
    }

    /// OK and EOF responses carry fresh status flags.
    pub fn carries_status(&self) -> bool {
        matches!(self, ResponseKind::Ok | ResponseKind::Eof)
    }
}

/// Fields of an OK (or EOF) response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status: StatusFlags,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    /// Parses an OK or EOF response and rewinds the packet.
    pub fn parse(packet: &mut Packet) -> Result<Self, ProtocolError> {
        packet.rewind();
        let result = Self::parse_fields(packet);
        packet.rewind();
        result
    }

    fn parse_fields(packet: &mut Packet) -> Result<Self, ProtocolError> {
        let marker = packet.read_u8()?;
        if marker == EOF_MARKER && packet.len() < MAX_EOF_LENGTH {
            let warnings = packet.read_u16_le()?;
            let status = StatusFlags::new(packet.read_u16_le()?);
            return Ok(Self {
                status,
                warnings,
                ..Self::default()
            });
        }
        if marker != OK_MARKER && marker != EOF_MARKER {
            return Err(ProtocolError::Malformed(format!(
                "expected OK packet, found marker 0x{marker:02x}"
            )));
        }

        let affected_rows = packet.read_lenenc_int()?;
        let last_insert_id = packet.read_lenenc_int()?;
        let status = StatusFlags::new(packet.read_u16_le()?);
        let warnings = packet.read_u16_le()?;
        let info = String::from_utf8_lossy(packet.read_rest()).into_owned();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status,
            warnings,
            info,
        })
    }
}
