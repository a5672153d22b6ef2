//! Protocol error types and server error-envelope decoding.

use crate::packet::Packet;
use crate::ERROR_MARKER;
use thiserror::Error;

/// Protocol-level errors raised while framing or parsing packets.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("packet sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    #[error("unexpected end of packet: need {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("zlib stream error: {0}")]
    Zlib(#[from] std::io::Error),

    #[error("decompressed size mismatch: header says {expected} bytes, got {actual}")]
    DecompressedSize { expected: usize, actual: usize },
}

/// A decoded error envelope sent by the server.
///
/// `sql_state` is always a five-character SQLSTATE, either taken from the
/// `#SSSSS` prefix of the message or derived from `code`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} ({sql_state}): {message}")]
pub struct ServerError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

/// ER_QUERY_INTERRUPTED.
pub const ER_QUERY_INTERRUPTED: u16 = 1317;
/// ER_STATEMENT_TIMEOUT (MariaDB max_statement_time).
pub const ER_STATEMENT_TIMEOUT: u16 = 1969;
/// ER_QUERY_TIMEOUT (MySQL max_execution_time).
pub const ER_QUERY_TIMEOUT: u16 = 3024;

impl ServerError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: sql_state_for(code).to_string(),
            message: message.into(),
        }
    }

    /// The statement was interrupted (KILL QUERY or a server-side timeout).
    pub fn is_interrupted(&self) -> bool {
        self.code == ER_QUERY_INTERRUPTED || self.sql_state == "70100" || self.is_statement_timeout()
    }

    /// The server aborted the statement because its execution time limit hit.
    pub fn is_statement_timeout(&self) -> bool {
        matches!(self.code, ER_STATEMENT_TIMEOUT | ER_QUERY_TIMEOUT)
    }
}

/// Inspects the marker byte of `packet` and decodes an error envelope.
///
/// Returns `Ok(None)` with the read position untouched when the packet is not
/// an error response.
pub fn decode_error(packet: &mut Packet) -> Result<Option<ServerError>, ProtocolError> {
    let start = packet.position();
    if packet.read_u8()? != ERROR_MARKER {
        packet.set_position(start);
        return Ok(None);
    }

    let code = packet.read_u16_le()?;
    let rest = packet.read_rest();

    let (sql_state, message) = match rest.split_first() {
        Some((b'#', tail)) if tail.len() >= 5 => {
            let state = String::from_utf8_lossy(&tail[..5]).into_owned();
            let state = if state == "HY000" {
                sql_state_for(code).to_string()
            } else {
                state
            };
            (state, String::from_utf8_lossy(&tail[5..]).into_owned())
        }
        _ => (
            sql_state_for(code).to_string(),
            String::from_utf8_lossy(rest).into_owned(),
        ),
    };

    Ok(Some(ServerError {
        code,
        sql_state,
        message,
    }))
}

/// Maps a server error number to its SQLSTATE.
pub fn sql_state_for(code: u16) -> &'static str {
    match code {
        1022 | 1048 | 1052 | 1062 | 1169 | 1216 | 1217 | 1451 | 1452 | 1557 | 1586 => "23000",
        1037 | 1038 => "HY001",
        1040 => "08004",
        1042 | 1043 | 1047 | 1053 | 1080 | 1152..=1161 => "08S01",
        1044 | 1049 | 1064 | 1142 | 1143 | 1149 | 1227 => "42000",
        1045 => "28000",
        1046 => "3D000",
        1050 => "42S01",
        1051 | 1146 => "42S02",
        1054 => "42S22",
        1213 => "40001",
        1264 | 1690 => "22003",
        1292 => "22007",
        1317 | ER_STATEMENT_TIMEOUT => "70100",
        1365 => "22012",
        1406 => "22001",
        _ => "HY000",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_with_sql_state() {
        let mut payload = vec![0xFF, 0x6E, 0x04, b'#', b'4', b'2', b'0', b'0', b'0'];
        payload.extend_from_slice(b"Unknown column");
        let mut packet = Packet::from_payload(&payload, 1);

        let err = decode_error(&mut packet).unwrap().unwrap();
        assert_eq!(
            err,
            ServerError {
                code: 1134,
                sql_state: "42000".to_string(),
                message: "Unknown column".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_error_without_sql_state() {
        let mut payload = vec![0xFF, 0x15, 0x04];
        payload.extend_from_slice(b"Access denied");
        let mut packet = Packet::from_payload(&payload, 2);

        let err = decode_error(&mut packet).unwrap().unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    fn test_placeholder_state_replaced() {
        // 1146 = 0x047A, no such table
        let mut payload = vec![0xFF, 0x7A, 0x04];
        payload.extend_from_slice(b"#HY000Table 't' doesn't exist");
        let mut packet = Packet::from_payload(&payload, 1);

        let err = decode_error(&mut packet).unwrap().unwrap();
        assert_eq!(err.sql_state, "42S02");
        assert_eq!(err.message, "Table 't' doesn't exist");
    }

    #[test]
    fn test_success_packet_is_rewound() {
        let mut packet = Packet::from_payload(&[0x00, 0x00, 0x00, 0x02, 0x00], 1);
        assert!(decode_error(&mut packet).unwrap().is_none());
        assert_eq!(packet.position(), 0);
    }

    #[test]
    fn test_truncated_error_packet() {
        let mut packet = Packet::from_payload(&[0xFF, 0x01], 1);
        let result = decode_error(&mut packet);
        assert!(matches!(result, Err(ProtocolError::UnexpectedEnd { .. })));
    }

    #[test]
    fn test_interrupt_classification() {
        assert!(ServerError::new(1317, "Query execution was interrupted").is_interrupted());
        assert!(ServerError::new(1969, "max_statement_time exceeded").is_statement_timeout());
        assert!(ServerError::new(3024, "maximum statement execution time exceeded").is_interrupted());
        assert!(!ServerError::new(1064, "syntax").is_interrupted());
    }

    #[test]
    fn test_sql_state_lookup() {
        assert_eq!(sql_state_for(1062), "23000");
        assert_eq!(sql_state_for(1064), "42000");
        assert_eq!(sql_state_for(1155), "08S01");
        assert_eq!(sql_state_for(9999), "HY000");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnsupportedVersion(9);
        assert!(err.to_string().contains('9'));

        let err = ProtocolError::PacketTooLarge {
            size: 2000,
            max: 1024,
        };
        assert!(err.to_string().contains("2000"));

        let err = ProtocolError::SequenceMismatch {
            expected: 6,
            actual: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains('6') && msg.contains('7'));

        let err = ServerError::new(1045, "Access denied");
        assert_eq!(err.to_string(), "1045 (28000): Access denied");
    }
}
