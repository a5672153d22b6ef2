//! Scripted in-memory server for connection tests.

use crate::auth::CLEAR_PASSWORD;
use crate::codec::FrameCodec;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::socket::Socket;
use crate::transport::{PacketChannel, Transport};
use bytes::{BufMut, BytesMut};
use myrtle_protocol::consts::charset;
use myrtle_protocol::packet::put_lenenc_int;
use myrtle_protocol::{
    begin_frame, Capabilities, CapabilityFlags, ConnectionState, FrameHeader, Packet,
    ServerVersion, StatusFlags, DEFAULT_COMPRESSION_THRESHOLD, PROTOCOL_VERSION,
};
use std::time::Duration;
use tokio::io::DuplexStream;

pub(crate) const SERVER_FLAGS: u32 = CapabilityFlags::LONG_PASSWORD
    | CapabilityFlags::LONG_FLAG
    | CapabilityFlags::CONNECT_WITH_DB
    | CapabilityFlags::PROTOCOL_41
    | CapabilityFlags::TRANSACTIONS
    | CapabilityFlags::SECURE_CONNECTION
    | CapabilityFlags::MULTI_RESULTS
    | CapabilityFlags::PS_MULTI_RESULTS
    | CapabilityFlags::PLUGIN_AUTH
    | CapabilityFlags::PLUGIN_AUTH_LENENC_CLIENT_DATA;

pub(crate) fn greeting(flags: u32) -> Capabilities {
    Capabilities {
        protocol_version: PROTOCOL_VERSION,
        server_version: ServerVersion::parse("8.0.36"),
        server_version_raw: "8.0.36".to_string(),
        thread_id: 7,
        seed: *b"abcdefgh",
        seed_ext: b"ijklmnopqrst".to_vec(),
        flags: CapabilityFlags::new(flags),
        charset: charset::UTF8MB4_GENERAL_CI,
        status: StatusFlags::new(StatusFlags::AUTOCOMMIT),
        auth_plugin_data_len: Some(21),
        auth_plugin: Some(CLEAR_PASSWORD.to_string()),
    }
}

/// Server end of a duplex pipe, speaking through the same codec as the client.
pub(crate) struct TestServer {
    transport: Transport<DuplexStream>,
    codec: FrameCodec,
}

impl TestServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            transport: Transport::Plain(Socket::new(stream, Some(Duration::from_secs(5)))),
            codec: FrameCodec::new(ConnectionState::new(true, usize::MAX), None),
        }
    }

    pub fn enable_compression(&mut self) {
        self.transport
            .enable_compression(DEFAULT_COMPRESSION_THRESHOLD, true);
    }

    /// Reads the next packet of the current exchange.
    pub async fn expect_packet(&mut self) -> Packet {
        self.codec.read_packet(&mut self.transport).await.unwrap()
    }

    /// Reads the first packet of a new command exchange.
    pub async fn expect_command(&mut self) -> Packet {
        self.codec.reset();
        self.transport.reset_sequence();
        self.expect_packet().await
    }

    /// Replies with the next sequence number.
    pub async fn send_raw(&mut self, payload: &[u8]) {
        let mut frame = BytesMut::new();
        begin_frame(&mut frame);
        frame.put_slice(payload);
        self.codec
            .write_packet(&mut self.transport, &mut frame)
            .await
            .unwrap();
    }

    /// Writes a frame with an arbitrary sequence number.
    pub async fn send_frame(&mut self, sequence: u8, payload: &[u8]) {
        let mut frame = FrameHeader::new(payload.len() as u32, sequence)
            .encode()
            .to_vec();
        frame.extend_from_slice(payload);
        self.transport.write_frame(&frame).await.unwrap();
        self.transport.flush().await.unwrap();
    }

    pub async fn send_greeting(&mut self, capabilities: &Capabilities) {
        let mut payload = BytesMut::new();
        capabilities.encode(&mut payload);
        self.send_raw(&payload).await;
    }

    pub async fn send_ok(&mut self, affected_rows: u64, last_insert_id: u64, status: u16, warnings: u16) {
        let mut payload = BytesMut::new();
        payload.put_u8(0x00);
        put_lenenc_int(&mut payload, affected_rows);
        put_lenenc_int(&mut payload, last_insert_id);
        payload.put_u16_le(status);
        payload.put_u16_le(warnings);
        self.send_raw(&payload).await;
    }

    pub async fn send_err(&mut self, code: u16, sql_state: &str, message: &str) {
        let mut payload = BytesMut::new();
        payload.put_u8(0xFF);
        payload.put_u16_le(code);
        payload.put_u8(b'#');
        payload.put_slice(sql_state.as_bytes());
        payload.put_slice(message.as_bytes());
        self.send_raw(&payload).await;
    }

    /// Greets, reads the login packet and accepts it.
    pub async fn accept_login(&mut self, flags: u32) -> Packet {
        self.send_greeting(&greeting(flags)).await;
        let login = self.expect_packet().await;
        self.send_ok(0, 0, StatusFlags::AUTOCOMMIT, 0).await;
        login
    }
}

/// A logged-in connection and the server it talks to.
pub(crate) async fn connected_pair(config: ConnectionConfig) -> (Connection<DuplexStream>, TestServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut conn = Connection::new(client, config);
    let mut server = TestServer::new(server);

    let (result, _) = tokio::join!(conn.negotiate_plain(), server.accept_login(SERVER_FLAGS));
    result.unwrap();
    (conn, server)
}
