//! Initial handshake: greeting, optional TLS upgrade and login.

use crate::connection::Connection;
use crate::error::ClientError;
use crate::socket::Socket;
use crate::transport::Transport;
use myrtle_protocol::{
    begin_frame, decode_error, AuthSwitch, Capabilities, CapabilityFlags, HandshakeResponse,
    OkPacket, ProtocolError, SslRequest, EOF_MARKER, ERROR_MARKER, OK_MARKER,
};
use serde::Serialize;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};

/// Marker of an extra authentication data packet.
const AUTH_MORE_DATA: u8 = 0x01;

/// Upper bound on server round trips during login.
const MAX_AUTH_ROUNDS: usize = 8;

/// Where a connection is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    AwaitingHandshake,
    /// Greeting parsed, login not finished.
    Negotiated,
    Authenticated,
}

type NoUpgrade<S> = fn(S) -> std::future::Ready<Result<S, ClientError>>;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the handshake without a TLS upgrade.
    pub async fn negotiate_plain(&mut self) -> Result<(), ClientError> {
        self.negotiate(None::<NoUpgrade<S>>).await
    }

    /// Reads the server greeting, upgrades the stream with `upgrade` when
    /// given, then logs in.
    ///
    /// Any failure rejects the connection: the stream is dropped and the
    /// connection stays closed.
    pub async fn negotiate<F, Fut>(&mut self, upgrade: Option<F>) -> Result<(), ClientError>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = Result<S, ClientError>>,
    {
        if self.negotiation != NegotiationState::AwaitingHandshake {
            return Err(ClientError::Protocol(ProtocolError::Malformed(
                "handshake already performed".to_string(),
            )));
        }

        let result = self.handshake(upgrade).await;
        if let Err(e) = &result {
            tracing::warn!("handshake failed: {}", e);
            self.poison();
        }
        result
    }

    async fn handshake<F, Fut>(&mut self, upgrade: Option<F>) -> Result<(), ClientError>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = Result<S, ClientError>>,
    {
        self.codec.reset();
        let packet = self.buffers.checkout_recv();
        self.codec.read_into(&mut self.transport, packet).await?;
        if let Some(error) = decode_error(packet)? {
            return Err(ClientError::Server(error));
        }

        let capabilities = Capabilities::parse(packet)?;
        tracing::debug!(
            server = %capabilities.server_version_raw,
            thread_id = capabilities.thread_id,
            flags = format_args!("{:#010x}", capabilities.flags.bits()),
            "received server greeting"
        );
        self.negotiation = NegotiationState::Negotiated;

        let flags = capabilities.client_flags(
            self.config.database.is_some(),
            self.config.compress,
            upgrade.is_some(),
        );
        let max_packet = u32::try_from(self.config.max_allowed_packet).unwrap_or(u32::MAX);
        let charset = self.encoding.charset();

        if let Some(upgrade) = upgrade {
            if !capabilities.supports(CapabilityFlags::SSL) {
                return Err(ClientError::SecurityUpgradeUnavailable(format!(
                    "server {} does not offer TLS",
                    capabilities.server_version_raw
                )));
            }
            let frame = self.buffers.checkout_send();
            begin_frame(frame);
            SslRequest {
                flags,
                max_packet,
                charset,
            }
            .encode(frame);
            self.codec.write_packet(&mut self.transport, frame).await?;
            self.upgrade_transport(upgrade).await?;
        }

        let advertised = capabilities.auth_plugin.as_deref();
        let password = self
            .encoding
            .encode(self.config.password.as_deref().unwrap_or_default())
            .into_owned();
        let auth_response = match self.auth.select(advertised) {
            Some(plugin) => self.auth.respond(plugin, &password, &capabilities.scramble())?,
            None => {
                tracing::debug!(
                    plugin = advertised.unwrap_or("-"),
                    "no registered plugin for server default, waiting for auth switch"
                );
                Vec::new()
            }
        };
        let plugin = advertised.unwrap_or_default().to_string();
        let user = self.encoding.encode(&self.config.user).into_owned();
        let database = self
            .config
            .database
            .as_deref()
            .map(|db| self.encoding.encode(db).into_owned());

        let frame = self.buffers.checkout_send();
        begin_frame(frame);
        HandshakeResponse {
            flags,
            max_packet,
            charset,
            user: &user,
            auth_response: &auth_response,
            database: database.as_deref(),
            auth_plugin: advertised,
        }
        .encode(frame)?;
        self.codec.write_packet(&mut self.transport, frame).await?;

        self.capabilities = Some(capabilities);
        self.client_flags = flags;
        self.authenticate(plugin, &password).await?;

        if self.config.compress {
            if flags.contains(CapabilityFlags::COMPRESS) {
                self.transport
                    .enable_compression(self.config.compression_threshold, self.config.check_sequence);
                self.codec.state_mut().set_compression(true);
                tracing::debug!("protocol compression enabled");
            } else {
                tracing::debug!("server does not support compression");
            }
        }

        tracing::debug!(user = %self.config.user, "authenticated");
        Ok(())
    }

    /// Hands the raw stream to `upgrade` and rebuilds the channel on the
    /// stream it returns.
    async fn upgrade_transport<F, Fut>(&mut self, upgrade: F) -> Result<(), ClientError>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = Result<S, ClientError>>,
    {
        let socket = self
            .transport
            .take_socket()
            .ok_or(ClientError::NotConnected)?;
        let timeout = socket.read_timeout();

        let secured = upgrade(socket.into_inner()).await.map_err(|e| match e {
            e @ (ClientError::SecurityUpgradeFailed(_) | ClientError::TlsConfig(_)) => e,
            other => ClientError::SecurityUpgradeFailed(other.to_string()),
        })?;
        self.transport = Transport::Plain(Socket::new(secured, timeout));
        tracing::debug!("stream upgraded to TLS");
        Ok(())
    }

    /// Reads server replies until the login is accepted or rejected.
    async fn authenticate(&mut self, mut plugin: String, password: &[u8]) -> Result<(), ClientError> {
        for _ in 0..MAX_AUTH_ROUNDS {
            let packet = self.buffers.checkout_recv();
            self.codec.read_into(&mut self.transport, packet).await?;

            let reply = match packet.peek_u8() {
                Some(OK_MARKER) => {
                    let ok = OkPacket::parse(packet)?;
                    if let Some(caps) = self.capabilities.as_mut() {
                        caps.set_status(ok.status);
                    }
                    self.negotiation = NegotiationState::Authenticated;
                    return Ok(());
                }
                Some(ERROR_MARKER) => {
                    return match decode_error(packet)? {
                        Some(error) => Err(ClientError::Server(error)),
                        None => Err(ProtocolError::Malformed("undecodable error packet".to_string()).into()),
                    };
                }
                Some(EOF_MARKER) => {
                    let switch = AuthSwitch::parse(packet)?;
                    tracing::debug!(plugin = %switch.plugin, "server requested authentication switch");
                    let response = self.auth.respond(&switch.plugin, password, &switch.data)?;
                    plugin = switch.plugin;
                    Some(response)
                }
                Some(AUTH_MORE_DATA) => {
                    packet.skip(1)?;
                    let data = packet.read_rest().to_vec();
                    self.auth.more_data(&plugin, password, &data)?
                }
                other => {
                    return Err(ProtocolError::Malformed(format!(
                        "unexpected authentication packet marker {:02x?}",
                        other
                    ))
                    .into())
                }
            };

            if let Some(response) = reply {
                let frame = self.buffers.checkout_send();
                begin_frame(frame);
                frame.extend_from_slice(&response);
                self.codec.write_packet(&mut self.transport, frame).await?;
            }
        }

        Err(ClientError::Auth(format!(
            "login not finished after {} server round trips",
            MAX_AUTH_ROUNDS
        )))
    }
}
