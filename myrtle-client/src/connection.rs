//! Connection management and command dispatch.

use crate::auth::AuthRegistry;
use crate::codec::FrameCodec;
use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::negotiate::NegotiationState;
use crate::socket::Socket;
use crate::stream::ClientStream;
use crate::trace::FrameTrace;
use crate::transport::{Activity, PacketChannel, Transport};
use bytes::{BufMut, BytesMut};
use myrtle_protocol::{
    begin_frame, decode_error, Capabilities, CapabilityFlags, Command, ConnectionState, OkPacket,
    Packet, PacketBuffers, ResponseKind, ServerError, ServerVersion, StatusFlags, TextEncoding,
    FRAME_HEADER_SIZE,
};
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

const INTERRUPT_NONE: u8 = 0;
const INTERRUPT_CANCELLED: u8 = 1;
const INTERRUPT_TIMED_OUT: u8 = 2;

/// Why the caller interrupted the command in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Shared flag used to tell the dispatcher that the statement in flight was
/// interrupted on purpose.
///
/// Killing the statement on the server is left to the caller (typically a
/// `KILL QUERY` on a second connection). Marking the handle first lets the
/// dispatcher report the resulting error as a cancellation or a timeout
/// instead of a plain server error.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    state: Arc<AtomicU8>,
}

impl InterruptHandle {
    pub fn cancel(&self) {
        self.state.store(INTERRUPT_CANCELLED, Ordering::SeqCst);
    }

    pub fn time_out(&self) {
        self.state.store(INTERRUPT_TIMED_OUT, Ordering::SeqCst);
    }

    pub fn peek(&self) -> Option<Interrupt> {
        Self::decode(self.state.load(Ordering::SeqCst))
    }

    /// Clears the mark and returns what it was.
    pub fn take(&self) -> Option<Interrupt> {
        Self::decode(self.state.swap(INTERRUPT_NONE, Ordering::SeqCst))
    }

    fn decode(raw: u8) -> Option<Interrupt> {
        match raw {
            INTERRUPT_CANCELLED => Some(Interrupt::Cancelled),
            INTERRUPT_TIMED_OUT => Some(Interrupt::TimedOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Argument<'a> {
    None,
    Text(&'a str),
    Bytes(&'a [u8]),
}

/// One command to dispatch.
#[derive(Debug, Clone)]
pub struct CommandRequest<'a> {
    code: u8,
    payload: Option<&'a [u8]>,
    argument: Argument<'a>,
    encoding: Option<TextEncoding>,
    timeout: Option<Duration>,
}

impl<'a> CommandRequest<'a> {
    pub fn new(command: Command) -> Self {
        Self::raw(command.code())
    }

    /// A command by its raw code.
    pub fn raw(code: u8) -> Self {
        Self {
            code,
            payload: None,
            argument: Argument::None,
            encoding: None,
            timeout: None,
        }
    }

    /// Text appended after the command byte, encoded with the request's
    /// encoding (or the connection's).
    pub fn with_text(mut self, text: &'a str) -> Self {
        self.argument = Argument::Text(text);
        self
    }

    pub fn with_bytes(mut self, bytes: &'a [u8]) -> Self {
        self.argument = Argument::Bytes(bytes);
        self
    }

    /// Sends `payload` verbatim. It must already start with the command byte.
    pub fn with_payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Read timeout for this command only.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    fn encode(&self, frame: &mut BytesMut, default_encoding: TextEncoding) {
        begin_frame(frame);
        if let Some(payload) = self.payload {
            frame.put_slice(payload);
            return;
        }
        frame.put_u8(self.code);
        match self.argument {
            Argument::None => {}
            Argument::Text(text) => {
                let encoding = self.encoding.unwrap_or(default_encoding);
                frame.put_slice(&encoding.encode(text));
            }
            Argument::Bytes(bytes) => frame.put_slice(bytes),
        }
    }
}

/// A client connection to a MySQL-compatible server.
///
/// The API takes `&mut self`, so a connection has at most one command in
/// flight. Share it behind a mutex or use one connection per task.
pub struct Connection<S = ClientStream> {
    pub(crate) config: ConnectionConfig,
    pub(crate) transport: Transport<S>,
    pub(crate) codec: FrameCodec,
    pub(crate) buffers: PacketBuffers,
    pub(crate) capabilities: Option<Capabilities>,
    pub(crate) client_flags: CapabilityFlags,
    pub(crate) negotiation: NegotiationState,
    pub(crate) auth: AuthRegistry,
    pub(crate) encoding: TextEncoding,
    last_ok: OkPacket,
    interrupt: InterruptHandle,
    /// Set while a command is being dispatched. Still set on entry means the
    /// previous command's future was dropped halfway through.
    in_flight: bool,
}

impl Connection<ClientStream> {
    /// Opens a TCP connection and performs the handshake and login.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let addr = config.addr();
        tracing::debug!("connecting to {}", addr);

        let tcp = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ClientError::communication(
                    io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr)),
                    Activity::default(),
                )
            })?
            .map_err(|e| ClientError::communication(e, Activity::default()))?;

        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY: {}", e);
        }

        let tls = config.tls.clone().filter(|tls| tls.enabled);
        let host = config.host.clone();
        let mut conn = Connection::new(ClientStream::Plain { stream: tcp }, config);

        match tls {
            Some(tls) => {
                conn.negotiate(Some(move |stream: ClientStream| async move {
                    stream.into_tls(&tls, &host).await
                }))
                .await?
            }
            None => conn.negotiate_plain().await?,
        }
        Ok(conn)
    }

    /// Whether the stream was upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        self.transport
            .socket()
            .map(|socket| socket.get_ref().is_tls())
            .unwrap_or(false)
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already-open stream. Call [`Connection::negotiate`] next.
    pub fn new(stream: S, config: ConnectionConfig) -> Self {
        let state = ConnectionState::new(config.check_sequence, config.max_allowed_packet);
        let trace = config
            .trace_frames
            .then(|| FrameTrace::new(config.trace_capacity));

        Self {
            transport: Transport::Plain(Socket::new(stream, config.socket_timeout())),
            codec: FrameCodec::new(state, trace),
            buffers: PacketBuffers::new(config.read_buffer_size, config.reclaim_threshold),
            capabilities: None,
            client_flags: CapabilityFlags::default(),
            negotiation: NegotiationState::AwaitingHandshake,
            auth: AuthRegistry::default(),
            encoding: config.encoding,
            last_ok: OkPacket::default(),
            interrupt: InterruptHandle::default(),
            in_flight: false,
            config,
        }
    }

    /// Replaces the authentication plugins used at login.
    pub fn with_auth_registry(mut self, auth: AuthRegistry) -> Self {
        self.auth = auth;
        self
    }

    pub fn auth_mut(&mut self) -> &mut AuthRegistry {
        &mut self.auth
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub fn server_version(&self) -> Option<&ServerVersion> {
        self.capabilities.as_ref().map(|caps| &caps.server_version)
    }

    /// Capability flags announced by the client at login.
    pub fn client_flags(&self) -> CapabilityFlags {
        self.client_flags
    }

    /// Server status flags from the last command's OK or EOF response.
    ///
    /// Cleared when a command is dispatched, so a command answered with a
    /// result set or an error reports no flags.
    pub fn status(&self) -> StatusFlags {
        self.capabilities
            .as_ref()
            .map(|caps| caps.status)
            .unwrap_or_default()
    }

    /// The OK response of the last command, zeroed when it had none.
    pub fn last_response(&self) -> &OkPacket {
        &self.last_ok
    }

    pub fn affected_rows(&self) -> u64 {
        self.last_ok.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_ok.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.last_ok.warnings
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn frame_trace(&self) -> Option<&FrameTrace> {
        self.codec.trace()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn is_compressed(&self) -> bool {
        self.transport.is_compressed()
    }

    /// Sends a command and reads its response.
    ///
    /// The returned packet is positioned at the start of its payload. It is
    /// the connection's receive buffer, so it is only valid until the next
    /// command.
    pub async fn execute(&mut self, request: CommandRequest<'_>) -> Result<&mut Packet, ClientError> {
        self.run(&request, true).await?;
        Ok(self.buffers.recv_mut())
    }

    /// Sends a command without reading a response.
    pub async fn send_command(&mut self, request: CommandRequest<'_>) -> Result<(), ClientError> {
        self.run(&request, false).await
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.execute(CommandRequest::new(Command::Ping)).await?;
        Ok(())
    }

    /// Runs a text query and returns the first response packet.
    pub async fn query(&mut self, sql: &str) -> Result<&mut Packet, ClientError> {
        self.execute(CommandRequest::new(Command::Query).with_text(sql))
            .await
    }

    /// Switches the default database.
    pub async fn init_db(&mut self, database: &str) -> Result<(), ClientError> {
        self.execute(CommandRequest::new(Command::InitDb).with_text(database))
            .await?;
        self.config.database = Some(database.to_string());
        Ok(())
    }

    /// Returns the server's human-readable status line.
    pub async fn statistics(&mut self) -> Result<String, ClientError> {
        let packet = self.execute(CommandRequest::new(Command::Statistics)).await?;
        Ok(String::from_utf8_lossy(packet.read_rest()).into_owned())
    }

    /// Resets session state on the server without re-authenticating.
    pub async fn reset_connection(&mut self) -> Result<(), ClientError> {
        self.execute(CommandRequest::new(Command::ResetConnection))
            .await?;
        Ok(())
    }

    /// Sends `COM_QUIT` and shuts the stream down.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if self.transport.is_closed() {
            return Ok(());
        }
        if self.negotiation == NegotiationState::Authenticated {
            if let Err(e) = self.send_command(CommandRequest::new(Command::Quit)).await {
                tracing::debug!("COM_QUIT failed: {}", e);
            }
        }
        self.transport.shutdown().await;
        tracing::debug!("connection closed");
        Ok(())
    }

    async fn run(&mut self, request: &CommandRequest<'_>, read_response: bool) -> Result<(), ClientError> {
        if self.in_flight {
            tracing::warn!("previous command was abandoned mid-flight, closing connection");
            self.poison();
        }
        self.ensure_open()?;

        self.in_flight = true;
        let result = match request.timeout {
            Some(timeout) => {
                let mut scope = TimeoutScope::enter(self, timeout);
                scope.dispatch(request, read_response).await
            }
            None => self.dispatch(request, read_response).await,
        };
        self.in_flight = false;
        self.settle(result)
    }

    async fn dispatch(&mut self, request: &CommandRequest<'_>, read_response: bool) -> Result<(), ClientError> {
        self.codec.reset();
        self.transport.reset_sequence();
        self.last_ok = OkPacket::default();
        if let Some(caps) = self.capabilities.as_mut() {
            caps.set_status(StatusFlags::default());
        }
        // A mark left over from an earlier command does not apply to this one.
        self.interrupt.take();

        let frame = self.buffers.checkout_send();
        request.encode(frame, self.encoding);
        tracing::debug!(command = request.code, size = frame.len() - FRAME_HEADER_SIZE, "dispatching command");
        self.codec.write_packet(&mut self.transport, frame).await?;

        if Command::restarts_sequence(request.code) {
            self.codec.restart_inbound();
        }
        if !read_response {
            return Ok(());
        }

        let packet = self.buffers.checkout_recv();
        self.codec.read_into(&mut self.transport, packet).await?;
        let interrupt = self.interrupt.take();
        if let Some(error) = decode_error(packet)? {
            tracing::debug!(code = error.code, sql_state = %error.sql_state, "server returned error");
            return Err(classify_server_error(error, interrupt));
        }

        // The prepare response reuses the OK marker with a different layout.
        if request.code != Command::StmtPrepare.code() {
            self.refresh_status();
        }
        Ok(())
    }

    /// Picks up status flags and counters from an OK or EOF response.
    fn refresh_status(&mut self) {
        let packet = self.buffers.recv_mut();
        let kind = match ResponseKind::classify(packet) {
            Ok(kind) => kind,
            Err(_) => return,
        };
        if !kind.carries_status() {
            return;
        }
        match OkPacket::parse(packet) {
            Ok(ok) => {
                if let Some(caps) = self.capabilities.as_mut() {
                    caps.set_status(ok.status);
                }
                self.last_ok = ok;
            }
            Err(e) => tracing::debug!("could not parse OK response: {}", e),
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.transport.is_closed() || self.negotiation != NegotiationState::Authenticated {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    /// Closes the connection when `result` carries a fatal error.
    fn settle<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::warn!("closing connection after fatal error: {}", e);
                self.poison();
            }
        }
        result
    }

    pub(crate) fn poison(&mut self) {
        if let Some(trace) = self.codec.trace() {
            if !trace.is_empty() {
                tracing::debug!("recent frames:\n{}", trace.dump());
            }
        }
        self.transport = Transport::Closed;
    }
}

fn classify_server_error(error: ServerError, interrupt: Option<Interrupt>) -> ClientError {
    if error.is_statement_timeout() {
        ClientError::OperationTimedOut(error)
    } else if error.is_interrupted() {
        match interrupt {
            Some(Interrupt::TimedOut) => ClientError::OperationTimedOut(error),
            _ => ClientError::OperationCancelled(error),
        }
    } else {
        ClientError::Server(error)
    }
}

/// Overrides the socket read timeout until dropped.
///
/// Dropping restores the previous timeout, including when the dispatch
/// future is cancelled.
struct TimeoutScope<'c, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn: &'c mut Connection<S>,
    previous: Option<Duration>,
}

impl<'c, S> TimeoutScope<'c, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn enter(conn: &'c mut Connection<S>, timeout: Duration) -> Self {
        let previous = conn.transport.replace_read_timeout(Some(timeout));
        Self { conn, previous }
    }
}

impl<S> Deref for TimeoutScope<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Target = Connection<S>;

    fn deref(&self) -> &Self::Target {
        self.conn
    }
}

impl<S> DerefMut for TimeoutScope<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
    }
}

impl<S> Drop for TimeoutScope<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn drop(&mut self) {
        self.conn.transport.replace_read_timeout(self.previous);
    }
}
