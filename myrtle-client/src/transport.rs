//! Byte channels the frame codec reads from and writes to.
//!
//! [`Socket`] is the timed stream wrapper, [`Compressed`] decorates any
//! channel with compressed packet framing, and [`Transport`] picks between
//! them at runtime once negotiation has decided.

use crate::compressed::Compressed;
use crate::error::ClientError;
use crate::socket::Socket;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};

/// When the channel last moved bytes in each direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Activity {
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
}

impl Activity {
    pub fn record_send(&mut self) {
        self.last_send = Some(Instant::now());
    }

    pub fn record_recv(&mut self) {
        self.last_recv = Some(Instant::now());
    }

    pub fn since_last_send(&self) -> Option<Duration> {
        self.last_send.map(|t| t.elapsed())
    }

    pub fn since_last_recv(&self) -> Option<Duration> {
        self.last_recv.map(|t| t.elapsed())
    }
}

/// A bidirectional channel of logical frame bytes.
#[allow(async_fn_in_trait)]
pub trait PacketChannel {
    /// Fills `buf` completely unless the stream ends first; returns the
    /// number of bytes read.
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, ClientError>;

    /// Writes one sealed frame (header included).
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ClientError>;

    async fn flush(&mut self) -> Result<(), ClientError>;

    /// Called at the start of every command exchange.
    fn reset_sequence(&mut self) {}

    fn activity(&self) -> Activity;
}

/// The connection's active channel.
#[derive(Debug)]
pub enum Transport<S> {
    Plain(Socket<S>),
    Compressed(Compressed<Socket<S>>),
    Closed,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn is_closed(&self) -> bool {
        matches!(self, Transport::Closed)
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Transport::Compressed(_))
    }

    pub fn socket(&self) -> Option<&Socket<S>> {
        match self {
            Transport::Plain(socket) => Some(socket),
            Transport::Compressed(compressed) => Some(compressed.get_ref()),
            Transport::Closed => None,
        }
    }

    pub fn socket_mut(&mut self) -> Option<&mut Socket<S>> {
        match self {
            Transport::Plain(socket) => Some(socket),
            Transport::Compressed(compressed) => Some(compressed.get_mut()),
            Transport::Closed => None,
        }
    }

    /// Takes the socket out, leaving the transport closed.
    pub fn take_socket(&mut self) -> Option<Socket<S>> {
        match std::mem::replace(self, Transport::Closed) {
            Transport::Plain(socket) => Some(socket),
            Transport::Compressed(compressed) => Some(compressed.into_inner()),
            Transport::Closed => None,
        }
    }

    /// Switches a plain transport to compressed framing.
    pub fn enable_compression(&mut self, threshold: usize, check_sequence: bool) {
        if let Transport::Plain(_) = self {
            if let Some(socket) = self.take_socket() {
                *self = Transport::Compressed(Compressed::new(socket, threshold, check_sequence));
            }
        }
    }

    /// Replaces the socket read timeout, returning the previous one.
    pub fn replace_read_timeout(&mut self, timeout: Option<Duration>) -> Option<Duration> {
        match self.socket_mut() {
            Some(socket) => socket.replace_read_timeout(timeout),
            None => None,
        }
    }

    /// Shuts the stream down and leaves the transport closed.
    pub async fn shutdown(&mut self) {
        if let Some(mut socket) = self.take_socket() {
            socket.shutdown().await;
        }
    }
}

impl<S> PacketChannel for Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        match self {
            Transport::Plain(socket) => socket.read_full(buf).await,
            Transport::Compressed(compressed) => compressed.read_full(buf).await,
            Transport::Closed => Err(ClientError::NotConnected),
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ClientError> {
        match self {
            Transport::Plain(socket) => socket.write_frame(frame).await,
            Transport::Compressed(compressed) => compressed.write_frame(frame).await,
            Transport::Closed => Err(ClientError::NotConnected),
        }
    }

    async fn flush(&mut self) -> Result<(), ClientError> {
        match self {
            Transport::Plain(socket) => socket.flush().await,
            Transport::Compressed(compressed) => compressed.flush().await,
            Transport::Closed => Err(ClientError::NotConnected),
        }
    }

    fn reset_sequence(&mut self) {
        match self {
            Transport::Plain(socket) => socket.reset_sequence(),
            Transport::Compressed(compressed) => compressed.reset_sequence(),
            Transport::Closed => {}
        }
    }

    fn activity(&self) -> Activity {
        match self {
            Transport::Plain(socket) => socket.activity(),
            Transport::Compressed(compressed) => compressed.activity(),
            Transport::Closed => Activity::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_starts_empty() {
        let mut activity = Activity::default();
        assert!(activity.since_last_send().is_none());
        assert!(activity.since_last_recv().is_none());
        activity.record_send();
        assert!(activity.since_last_send().is_some());
        assert!(activity.since_last_recv().is_none());
    }

    #[tokio::test]
    async fn test_transport_switches_to_compression() {
        let (client, _server) = tokio::io::duplex(64);
        let mut transport = Transport::Plain(Socket::new(client, None));
        assert!(!transport.is_compressed());

        transport.enable_compression(50, true);
        assert!(transport.is_compressed());
        assert!(transport.socket().is_some());

        let socket = transport.take_socket();
        assert!(socket.is_some());
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_io() {
        let mut transport: Transport<tokio::io::DuplexStream> = Transport::Closed;
        let mut buf = [0u8; 4];
        assert!(matches!(
            transport.read_full(&mut buf).await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            transport.write_frame(&buf).await,
            Err(ClientError::NotConnected)
        ));
        assert_eq!(transport.replace_read_timeout(Some(Duration::from_secs(1))), None);
    }
}
