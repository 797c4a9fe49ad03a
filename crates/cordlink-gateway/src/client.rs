//! Gateway client
//!
//! Owns the socket, the frame decoder, the heartbeat supervisor and the
//! session, and drives them through connect, poll and close.
//!
//! ```text
//! Disconnected ──connect──> Connecting ──socket open──> Handshaking
//!      ▲                                                     │ Hello, Identify/Resume
//!      └──────── close / timeout / peer close ───────── Ready
//! ```

use crate::connection::Connection;
use crate::decoder::FrameDecoder;
use crate::error::{GatewayError, GatewayResult};
use crate::heartbeat::{ConnectionHeartbeat, HeartbeatSupervisor};
use crate::protocol::{
    GatewayMessage, IdentifyProperties, Intents, OpCode, HEARTBEAT_TIMEOUT_CLOSE, RESUMABLE_CLOSE,
};
use crate::session::{Action, Session};
use cordlink_common::AppConfig;
use cordlink_http::HttpHandle;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Close status reported when the peer's close frame carries no code
const NO_STATUS_CLOSE: u16 = 1005;

type Reader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Callback invoked for every dispatch event, on the poll path
pub type Dispatcher = Box<dyn FnMut(&str, &Value) + Send>;

/// Hooks for traffic the client does not handle itself
pub trait GatewayExtension: Send {
    /// Payload with an opcode the session does not act on
    fn unknown_payload(&mut self, _message: &GatewayMessage) {}

    /// Socket frame that carries no gateway payload
    fn unknown_message(&mut self, _frame: &Message) {}
}

/// Extension that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpExtension;

impl GatewayExtension for NoOpExtension {}

/// Gateway client configuration
#[derive(Clone)]
pub struct GatewayConfig {
    /// Gateway URL without protocol query parameters
    pub url: String,
    pub version: u8,
    pub encoding: String,
    /// Transport compression; `None` disables it
    pub compress: Option<String>,
    pub token: String,
    pub intents: Intents,
    pub properties: IdentifyProperties,
    /// Silence tolerated before the peer is considered dead, in intervals
    pub heartbeat_grace_factor: f64,
    /// Added to twice the heartbeat interval to get the read timeout
    pub read_timeout_slack: Duration,
    /// Heartbeat interval assumed until Hello arrives
    pub default_heartbeat_interval_ms: u64,
    /// Upper bound for opening the socket and for receiving Hello
    pub handshake_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            version: 9,
            encoding: "json".to_string(),
            compress: Some("zlib-stream".to_string()),
            token: token.into(),
            intents: Intents::non_privileged(),
            properties: IdentifyProperties::default(),
            heartbeat_grace_factor: 1.5,
            read_timeout_slack: Duration::from_secs(20),
            default_heartbeat_interval_ms: 30_000,
            handshake_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_app_config(config: &AppConfig, url: impl Into<String>) -> Self {
        let mut gateway = Self::new(url, config.bot.token.clone());
        gateway.version = config.gateway.version;
        gateway.compress = config.gateway.compress.then(|| "zlib-stream".to_string());
        gateway.intents = config
            .bot
            .intents
            .map(Intents::from_bits_truncate)
            .unwrap_or_default();
        gateway.heartbeat_grace_factor = config.gateway.heartbeat_grace;
        gateway.read_timeout_slack = config.gateway.read_timeout_slack();
        gateway
    }

    #[must_use]
    pub fn with_intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }

    #[must_use]
    pub fn with_compress(mut self, compress: Option<&str>) -> Self {
        self.compress = compress.map(str::to_string);
        self
    }

    /// Connectable URL with `v`, `encoding` and `compress` query parameters
    pub fn gateway_url(&self) -> String {
        self.url_for(&self.url)
    }

    fn url_for(&self, base: &str) -> String {
        let (path, query) = match base.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (base, None),
        };

        let mut url = path.to_string();
        let has_path = path
            .split_once("://")
            .map_or(true, |(_, rest)| rest.contains('/'));
        if !has_path {
            url.push('/');
        }

        let mut params: Vec<String> = query
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .into_iter()
            .collect();
        params.push(format!("v={}", self.version));
        if !self.encoding.is_empty() {
            params.push(format!("encoding={}", self.encoding));
        }
        if let Some(compress) = &self.compress {
            params.push(format!("compress={compress}"));
        }

        url.push('?');
        url.push_str(&params.join("&"));
        url
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("version", &self.version)
            .field("encoding", &self.encoding)
            .field("compress", &self.compress)
            .field("token", &"[REDACTED]")
            .field("intents", &self.intents)
            .field("heartbeat_grace_factor", &self.heartbeat_grace_factor)
            .field("read_timeout_slack", &self.read_timeout_slack)
            .finish()
    }
}

/// Lifecycle of the physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Result of one poll step
#[derive(Debug)]
pub enum PollOutcome {
    /// A frame was processed; keep polling
    Continue,
    /// Connection is closed; reconnect with `resume = true`
    Reconnect(GatewayError),
    /// Connection is closed and the session cannot be resumed
    Fatal(GatewayError),
}

impl PollOutcome {
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }

    pub fn into_result(self) -> GatewayResult<()> {
        match self {
            Self::Continue => Ok(()),
            Self::Reconnect(e) | Self::Fatal(e) => Err(e),
        }
    }
}

/// Client for one gateway session
pub struct GatewayClient {
    config: GatewayConfig,
    session: Session,
    state: ConnectionState,
    connection: Option<Arc<Connection>>,
    reader: Option<Reader>,
    decoder: FrameDecoder,
    heartbeat: Option<HeartbeatSupervisor>,
    dispatcher: Option<Dispatcher>,
    extension: Box<dyn GatewayExtension>,
    http: Option<HttpHandle>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        let session = Session::new(
            config.token.clone(),
            config.intents,
            config.properties.clone(),
            config.default_heartbeat_interval_ms,
        );

        Self {
            config,
            session,
            state: ConnectionState::Disconnected,
            connection: None,
            reader: None,
            decoder: FrameDecoder::new(),
            heartbeat: None,
            dispatcher: None,
            extension: Box::new(NoOpExtension),
            http: None,
        }
    }

    #[must_use]
    pub fn with_dispatcher<F>(mut self, dispatcher: F) -> Self
    where
        F: FnMut(&str, &Value) + Send + 'static,
    {
        self.dispatcher = Some(Box::new(dispatcher));
        self
    }

    #[must_use]
    pub fn with_extension<E: GatewayExtension + 'static>(mut self, extension: E) -> Self {
        self.extension = Box::new(extension);
        self
    }

    /// Attach the REST client; an owned handle is released on `close`
    #[must_use]
    pub fn with_http(mut self, http: HttpHandle) -> Self {
        self.http = Some(http);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn http(&self) -> Option<&HttpHandle> {
        self.http.as_ref()
    }

    /// Round trip of the last acknowledged heartbeat on this connection
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.as_ref().and_then(HeartbeatSupervisor::latency)
    }

    pub fn is_closed(&self) -> bool {
        self.connection.as_ref().map_or(true, |conn| conn.is_closed())
    }

    /// Open a connection and complete the handshake
    ///
    /// With `resume` the stored session id and sequence are sent in a
    /// Resume; otherwise the session identity is reset and a fresh
    /// Identify is sent.
    pub async fn connect(&mut self, resume: bool) -> GatewayResult<()> {
        if self.connection.is_some() {
            tracing::debug!("Replacing open connection");
            self.teardown(RESUMABLE_CLOSE).await;
        }
        if !resume {
            self.session.reset_identity();
        }

        let url = match self.session.resume_gateway_url().filter(|_| resume) {
            Some(resume_url) => self.config.url_for(resume_url),
            None => self.config.gateway_url(),
        };

        self.state = ConnectionState::Connecting;
        tracing::info!(url = %url, resume, "Connecting to gateway");

        let stream = match tokio::time::timeout(self.config.handshake_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                return Err(e.into());
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                return Err(GatewayError::HandshakeTimeout(self.config.handshake_timeout));
            }
        };

        let (sink, reader) = stream.split();
        self.connection = Some(Connection::spawn(sink));
        self.reader = Some(reader);
        self.decoder.reset();
        self.state = ConnectionState::Handshaking;

        match self.handshake(resume).await {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Gateway handshake failed");
                self.teardown(e.close_code()).await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, resume: bool) -> GatewayResult<()> {
        let deadline = Instant::now() + self.config.handshake_timeout;

        let hello = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match self.next_frame(remaining).await {
                Err(GatewayError::ReadTimeout(_)) => {
                    return Err(GatewayError::HandshakeTimeout(self.config.handshake_timeout));
                }
                other => other?,
            };
            if let Message::Close(close) = &frame {
                return Err(peer_close(close.as_ref()));
            }
            if let Some(message) = self.decoder.feed(&frame)? {
                break message;
            }
        };

        if hello.opcode() != Some(OpCode::Hello) {
            return Err(GatewayError::UnexpectedFirstMessage(hello.op));
        }
        self.handle_message(hello)?;

        let (packet, resumed) = self.session.handshake_packet(resume)?;
        self.connection()?.send(&packet).await?;

        tracing::info!(
            resumed,
            session_id = ?self.session.session_id(),
            seq = ?self.session.sequence(),
            "Handshake sent"
        );
        Ok(())
    }

    /// Wait for and process one frame
    ///
    /// Any error closes the connection before it is reported.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let wait = self.session.read_timeout(self.config.read_timeout_slack);

        let result = match self.next_frame(wait).await {
            Ok(frame) => self.process_frame(frame),
            Err(e) => Err(e),
        };

        let Err(error) = result else {
            return PollOutcome::Continue;
        };

        self.teardown(error.close_code()).await;

        if error.is_reconnectable() {
            tracing::info!(
                error = %error,
                session_id = ?self.session.session_id(),
                seq = ?self.session.sequence(),
                "Gateway connection lost, resume required"
            );
            PollOutcome::Reconnect(error)
        } else {
            tracing::warn!(
                error = %error,
                code = ?error.peer_code(),
                reason = error.gateway_close_code().map(|c| c.description()),
                "Gateway session ended"
            );
            PollOutcome::Fatal(error)
        }
    }

    /// Close the connection and release session-scoped resources
    ///
    /// Defaults to a resumable close code. Calling this on a closed client
    /// is a no-op.
    pub async fn close(&mut self, code: Option<u16>) {
        let code = code.unwrap_or(RESUMABLE_CLOSE);
        let closed = self.teardown(code).await;

        if let Some(http) = &self.http {
            if http.release() {
                tracing::debug!("Released owned HTTP client");
            }
        }

        if closed {
            tracing::info!(code, "Gateway connection closed");
        }
    }

    async fn next_frame(&mut self, wait: Duration) -> GatewayResult<Message> {
        let (Some(connection), Some(reader)) = (self.connection.as_ref(), self.reader.as_mut()) else {
            return Err(GatewayError::NotConnected);
        };

        tokio::select! {
            biased;
            code = connection.closed() => Err(if code == HEARTBEAT_TIMEOUT_CLOSE {
                GatewayError::HeartbeatTimeout
            } else {
                GatewayError::ConnectionClosed { code: Some(code) }
            }),
            read = tokio::time::timeout(wait, reader.next()) => match read {
                Err(_) => Err(GatewayError::ReadTimeout(wait)),
                Ok(None) => Err(GatewayError::ConnectionClosed { code: None }),
                Ok(Some(Err(e))) => Err(e.into()),
                Ok(Some(Ok(frame))) => Ok(frame),
            },
        }
    }

    fn process_frame(&mut self, frame: Message) -> GatewayResult<()> {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.record_received();
        }

        match &frame {
            Message::Close(close) => return Err(peer_close(close.as_ref())),
            Message::Ping(_) | Message::Pong(_) => return Ok(()),
            Message::Text(_) | Message::Binary(_) => {}
            _ => {
                self.extension.unknown_message(&frame);
                return Ok(());
            }
        }

        match self.decoder.feed(&frame)? {
            Some(message) => self.handle_message(message),
            None => Ok(()),
        }
    }

    fn handle_message(&mut self, message: GatewayMessage) -> GatewayResult<()> {
        tracing::trace!(op = message.op, seq = ?message.s, event = ?message.t, "Gateway message received");

        match self.session.handle(message)? {
            Action::StartHeartbeat(interval) => self.start_heartbeat(interval)?,
            Action::HeartbeatAck => match &self.heartbeat {
                Some(heartbeat) => heartbeat.ack(),
                None => {
                    return Err(GatewayError::Protocol(
                        "heartbeat ACK received before Hello".to_string(),
                    ))
                }
            },
            Action::Dispatch { event, data } => {
                if let Some(dispatcher) = self.dispatcher.as_mut() {
                    dispatcher(&event, &data);
                }
            }
            Action::Forward(message) => self.extension.unknown_payload(&message),
        }
        Ok(())
    }

    fn start_heartbeat(&mut self, interval: Duration) -> GatewayResult<()> {
        let sink = ConnectionHeartbeat::new(self.connection()?, self.session.sequence_handle());
        let supervisor = HeartbeatSupervisor::start(interval, self.config.heartbeat_grace_factor, sink);
        tracing::debug!(
            interval_ms = supervisor.interval().as_millis() as u64,
            grace_ms = supervisor.grace().as_millis() as u64,
            "Heartbeat started"
        );

        if let Some(previous) = self.heartbeat.replace(supervisor) {
            previous.stop();
        }
        Ok(())
    }

    fn connection(&self) -> GatewayResult<&Arc<Connection>> {
        self.connection.as_ref().ok_or(GatewayError::NotConnected)
    }

    /// Stop heartbeat, close socket, drop per-connection state
    ///
    /// Each step runs regardless of the previous one. Returns whether the
    /// socket was closed by this call.
    async fn teardown(&mut self, code: u16) -> bool {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }

        let closed = match self.connection.take() {
            Some(connection) => connection.close(code).await,
            None => false,
        };

        self.reader = None;
        self.decoder.reset();
        self.state = ConnectionState::Disconnected;
        closed
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

fn peer_close(frame: Option<&tokio_tungstenite::tungstenite::protocol::CloseFrame<'_>>) -> GatewayError {
    match frame {
        Some(frame) => GatewayError::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        },
        None => GatewayError::Closed {
            code: NO_STATUS_CLOSE,
            reason: String::new(),
        },
    }
}
