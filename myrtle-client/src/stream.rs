//! Client stream abstraction for TLS and plain TCP.

use crate::config::TlsClientConfig;
use crate::error::ClientError;
use crate::tls::build_connector;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;

pin_project! {
    /// A client stream that starts as plain TCP and may be upgraded to TLS
    /// in the middle of the handshake.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl ClientStream {
    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }

    /// Runs the TLS handshake over the plain stream.
    pub async fn into_tls(self, config: &TlsClientConfig, host: &str) -> Result<Self, ClientError> {
        let tcp = match self {
            ClientStream::Plain { stream } => stream,
            ClientStream::Tls { .. } => {
                return Err(ClientError::SecurityUpgradeFailed(
                    "stream is already encrypted".to_string(),
                ))
            }
        };

        let (connector, server_name) = build_connector(config, host)?;
        tracing::debug!("performing TLS handshake with {}", host);
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ClientError::SecurityUpgradeFailed(e.to_string()))?;
        tracing::debug!("TLS handshake complete");
        Ok(ClientStream::Tls { stream })
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
