//! Client error types.

use crate::config::ConfigError;
use crate::transport::Activity;
use myrtle_protocol::{ProtocolError, ServerError};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("truncated packet header: got {read} of 4 bytes")]
    TruncatedHeader { read: usize },

    #[error("truncated packet payload: expected {expected} bytes, got {read}")]
    TruncatedPayload { expected: usize, read: usize },

    #[error("packet out of sequence: expected {expected}, got {actual}")]
    SequenceError { expected: u8, actual: u8 },

    #[error("packet too large: {size} bytes exceeds max_allowed_packet {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error(
        "communication failure: {source} ({})",
        describe_activity(.since_last_send, .since_last_recv)
    )]
    Communication {
        source: io::Error,
        since_last_send: Option<Duration>,
        since_last_recv: Option<Duration>,
    },

    #[error("server error: {0}")]
    Server(ServerError),

    #[error("operation cancelled: {0}")]
    OperationCancelled(ServerError),

    #[error("operation timed out: {0}")]
    OperationTimedOut(ServerError),

    #[error("secure transport unavailable: {0}")]
    SecurityUpgradeUnavailable(String),

    #[error("secure transport upgrade failed: {0}")]
    SecurityUpgradeFailed(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("out of memory reading a {size}-byte packet")]
    OutOfMemory { size: usize },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not connected")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Wraps an I/O failure with the channel's last activity times.
    pub fn communication(source: io::Error, activity: Activity) -> Self {
        ClientError::Communication {
            source,
            since_last_send: activity.since_last_send(),
            since_last_recv: activity.since_last_recv(),
        }
    }

    /// Returns whether the connection can no longer be trusted after this
    /// error and must be torn down.
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::TruncatedHeader { .. }
            | ClientError::TruncatedPayload { .. }
            | ClientError::SequenceError { .. }
            | ClientError::Communication { .. }
            | ClientError::OutOfMemory { .. }
            | ClientError::SecurityUpgradeUnavailable(_)
            | ClientError::SecurityUpgradeFailed(_)
            | ClientError::Protocol(_) => true,
            ClientError::PacketTooLarge { .. }
            | ClientError::Server(_)
            | ClientError::OperationCancelled(_)
            | ClientError::OperationTimedOut(_)
            | ClientError::TlsConfig(_)
            | ClientError::Auth(_)
            | ClientError::NotConnected
            | ClientError::Config(_) => false,
        }
    }

    /// The server's error envelope, if this error carries one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            ClientError::Server(e)
            | ClientError::OperationCancelled(e)
            | ClientError::OperationTimedOut(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::SequenceMismatch { expected, actual } => {
                ClientError::SequenceError { expected, actual }
            }
            ProtocolError::PacketTooLarge { size, max } => ClientError::PacketTooLarge { size, max },
            other => ClientError::Protocol(other),
        }
    }
}

fn describe_activity(send: &Option<Duration>, recv: &Option<Duration>) -> String {
    fn ago(d: &Option<Duration>) -> String {
        match d {
            Some(d) => format!("{} ms ago", d.as_millis()),
            None => "never".to_string(),
        }
    }
    format!("last packet sent {}, last packet received {}", ago(send), ago(recv))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ClientError::TruncatedHeader { read: 2 }.is_fatal());
        assert!(ClientError::SequenceError {
            expected: 6,
            actual: 7
        }
        .is_fatal());
        assert!(ClientError::SecurityUpgradeFailed("handshake".into()).is_fatal());

        assert!(!ClientError::PacketTooLarge {
            size: 2000,
            max: 1024
        }
        .is_fatal());
        assert!(!ClientError::Server(ServerError::new(1064, "syntax")).is_fatal());
        assert!(!ClientError::OperationCancelled(ServerError::new(1317, "interrupted")).is_fatal());
    }

    #[test]
    fn test_protocol_error_mapping() {
        let err: ClientError = ProtocolError::SequenceMismatch {
            expected: 2,
            actual: 9,
        }
        .into();
        assert!(matches!(
            err,
            ClientError::SequenceError {
                expected: 2,
                actual: 9
            }
        ));

        let err: ClientError = ProtocolError::Malformed("bad".into()).into();
        assert!(matches!(err, ClientError::Protocol(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_communication_message() {
        let err = ClientError::Communication {
            source: io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
            since_last_send: Some(Duration::from_millis(1500)),
            since_last_recv: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("read timed out"));
        assert!(msg.contains("1500 ms ago"));
        assert!(msg.contains("received never"));
    }

    #[test]
    fn test_server_error_accessor() {
        let err = ClientError::OperationTimedOut(ServerError::new(3024, "timeout"));
        assert_eq!(err.server_error().map(|e| e.code), Some(3024));
        assert!(ClientError::NotConnected.server_error().is_none());
    }
}
