//! Timed stream wrapper.

use crate::error::ClientError;
use crate::transport::{Activity, PacketChannel};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A byte stream with a per-read timeout.
#[derive(Debug)]
pub struct Socket<S> {
    stream: S,
    read_timeout: Option<Duration>,
    activity: Activity,
}

impl<S> Socket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            read_timeout,
            activity: Activity::default(),
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Sets a new read timeout and returns the old one.
    pub fn replace_read_timeout(&mut self, timeout: Option<Duration>) -> Option<Duration> {
        std::mem::replace(&mut self.read_timeout, timeout)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Best-effort shutdown of the write side.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("socket shutdown failed: {}", e);
        }
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.stream.read(buf))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("read timed out after {} ms", timeout.as_millis()),
                    )
                })?,
            None => self.stream.read(buf).await,
        }
    }
}

impl<S> PacketChannel for Socket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_some(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ClientError::communication(e, self.activity)),
            }
        }
        if filled > 0 {
            self.activity.record_recv();
        }
        Ok(filled)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ClientError> {
        self.stream
            .write_all(frame)
            .await
            .map_err(|e| ClientError::communication(e, self.activity))?;
        self.activity.record_send();
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ClientError> {
        self.stream
            .flush()
            .await
            .map_err(|e| ClientError::communication(e, self.activity))
    }

    fn activity(&self) -> Activity {
        self.activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_full_across_chunks() {
        let mock = Builder::new().read(b"ab").read(b"cd").read(b"e").build();
        let mut socket = Socket::new(mock, None);

        let mut buf = [0u8; 5];
        assert_eq!(socket.read_full(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"abcde");
        assert!(socket.activity().since_last_recv().is_some());
    }

    #[tokio::test]
    async fn test_read_full_short_on_eof() {
        let mock = Builder::new().read(b"ab").build();
        let mut socket = Socket::new(mock, None);

        let mut buf = [0u8; 4];
        assert_eq!(socket.read_full(&mut buf).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_error_is_communication() {
        let mock = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut socket = Socket::new(mock, None);

        let mut buf = [0u8; 4];
        let err = socket.read_full(&mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Communication {
                since_last_recv: None,
                ..
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut socket = Socket::new(client, Some(Duration::from_millis(20)));

        let mut buf = [0u8; 4];
        match socket.read_full(&mut buf).await {
            Err(ClientError::Communication { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_records_activity() {
        let mock = Builder::new().write(b"\x01\x00\x00\x00\x0e").build();
        let mut socket = Socket::new(mock, None);
        socket.write_frame(b"\x01\x00\x00\x00\x0e").await.unwrap();
        socket.flush().await.unwrap();
        assert!(socket.activity().since_last_send().is_some());
    }

    #[test]
    fn test_replace_read_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut socket = Socket::new(client, Some(Duration::from_secs(30)));
        let previous = socket.replace_read_timeout(Some(Duration::from_secs(1)));
        assert_eq!(previous, Some(Duration::from_secs(30)));
        assert_eq!(socket.read_timeout(), Some(Duration::from_secs(1)));
    }
}
