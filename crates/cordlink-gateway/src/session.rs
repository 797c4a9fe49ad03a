//! Session state machine
//!
//! Holds the connection identity (token, intents, session id, sequence) and
//! decides what each inbound message does. Session identity is only mutated
//! here; the heartbeat supervisor reads the sequence through a [`Sequence`]
//! handle.

use crate::error::{GatewayError, GatewayResult};
use crate::events;
use crate::protocol::{
    GatewayMessage, HelloPayload, IdentifyPayload, IdentifyProperties, Intents, OpCode,
    ReadyPayload, ResumePayload,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NO_SEQUENCE: u64 = u64::MAX;

/// Shared last-seen sequence number
#[derive(Clone)]
pub struct Sequence(Arc<AtomicU64>);

impl Sequence {
    fn new() -> Self {
        Self(Arc::new(AtomicU64::new(NO_SEQUENCE)))
    }

    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            NO_SEQUENCE => None,
            seq => Some(seq),
        }
    }

    fn set(&self, seq: u64) {
        self.0.store(seq, Ordering::Release);
    }

    fn reset(&self) {
        self.0.store(NO_SEQUENCE, Ordering::Release);
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sequence({:?})", self.get())
    }
}

/// Effect of an inbound message, carried out by the client
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Hello received: start heartbeating at this interval
    StartHeartbeat(Duration),
    /// Forward to the heartbeat supervisor
    HeartbeatAck,
    /// Application event for the dispatch callback
    Dispatch { event: String, data: Value },
    /// Not handled here; goes to the extension hook
    Forward(GatewayMessage),
}

/// Connection identity, kept across resumes
pub struct Session {
    token: String,
    intents: Intents,
    properties: IdentifyProperties,
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Sequence,
    heartbeat_interval_ms: u64,
    default_interval_ms: u64,
}

impl Session {
    pub fn new(
        token: impl Into<String>,
        intents: Intents,
        properties: IdentifyProperties,
        default_interval_ms: u64,
    ) -> Self {
        Self {
            token: token.into(),
            intents,
            properties,
            session_id: None,
            resume_gateway_url: None,
            sequence: Sequence::new(),
            heartbeat_interval_ms: default_interval_ms,
            default_interval_ms,
        }
    }

    pub fn intents(&self) -> Intents {
        self.intents
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// URL the peer asked resumes to connect to, from READY
    pub fn resume_gateway_url(&self) -> Option<&str> {
        self.resume_gateway_url.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence.get()
    }

    /// Read-only handle to the sequence, for stamping heartbeats
    pub fn sequence_handle(&self) -> Sequence {
        self.sequence.clone()
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// Forget the session before a fresh handshake
    pub fn reset_identity(&mut self) {
        self.session_id = None;
        self.resume_gateway_url = None;
        self.sequence.reset();
        self.heartbeat_interval_ms = self.default_interval_ms;
    }

    /// How long a poll may wait for the next frame
    pub fn read_timeout(&self, slack: Duration) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.saturating_mul(2)) + slack
    }

    pub fn identify_packet(&self) -> GatewayResult<GatewayMessage> {
        let payload = IdentifyPayload::new(self.token.clone(), self.intents, self.properties.clone());
        Ok(GatewayMessage::identify(&payload)?)
    }

    /// Resume packet, or `None` when no session id is known
    pub fn resume_packet(&self) -> GatewayResult<Option<GatewayMessage>> {
        let Some(session_id) = &self.session_id else {
            return Ok(None);
        };
        let payload = ResumePayload {
            token: self.token.clone(),
            session_id: session_id.clone(),
            seq: self.sequence.get(),
        };
        Ok(Some(GatewayMessage::resume(&payload)?))
    }

    /// Packet that completes the handshake
    ///
    /// Returns the packet and whether it is a Resume. Asking to resume
    /// without a session id falls back to Identify.
    pub fn handshake_packet(&self, resume: bool) -> GatewayResult<(GatewayMessage, bool)> {
        if resume {
            if let Some(packet) = self.resume_packet()? {
                return Ok((packet, true));
            }
            tracing::warn!("No session to resume, identifying instead");
        }
        Ok((self.identify_packet()?, false))
    }

    /// Interpret one inbound message
    ///
    /// Server-requested reconnects and invalid sessions come back as errors
    /// so the poll loop can close the connection and report the outcome.
    pub fn handle(&mut self, msg: GatewayMessage) -> GatewayResult<Action> {
        match msg.opcode() {
            Some(OpCode::Hello) => {
                let hello: HelloPayload = msg
                    .payload()
                    .map_err(|e| GatewayError::Protocol(format!("malformed Hello: {e}")))?;
                if hello.heartbeat_interval == 0 {
                    return Err(GatewayError::Protocol("Hello with zero heartbeat interval".to_string()));
                }
                self.heartbeat_interval_ms = hello.heartbeat_interval;
                tracing::debug!(interval_ms = hello.heartbeat_interval, "Hello received");
                Ok(Action::StartHeartbeat(Duration::from_millis(hello.heartbeat_interval)))
            }
            Some(OpCode::HeartbeatAck) => Ok(Action::HeartbeatAck),
            Some(OpCode::InvalidSession) => {
                let resumable = msg.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                tracing::info!(
                    session_id = ?self.session_id,
                    resumable,
                    "Session invalidated by server"
                );
                Err(GatewayError::InvalidSession { resumable })
            }
            Some(OpCode::Reconnect) => {
                tracing::info!(session_id = ?self.session_id, "Server requested reconnect");
                Err(GatewayError::ReconnectRequested)
            }
            Some(OpCode::Dispatch) => {
                let GatewayMessage { op, d, s, t } = msg;
                match t {
                    Some(event) => Ok(self.dispatch(event, s, d.unwrap_or(Value::Null))),
                    None => Ok(Action::Forward(GatewayMessage { op, d, s, t: None })),
                }
            }
            _ => Ok(Action::Forward(msg)),
        }
    }

    fn dispatch(&mut self, event: String, seq: Option<u64>, data: Value) -> Action {
        if events::is_session_event(&event) {
            self.update_identity(&event, &data);
        }

        if let Some(seq) = seq {
            self.sequence.set(seq);
        }

        Action::Dispatch { event, data }
    }

    fn update_identity(&mut self, event: &str, data: &Value) {
        if event == events::RESUMED {
            tracing::info!(session_id = ?self.session_id, seq = ?self.sequence(), "Session resumed");
            return;
        }

        match serde_json::from_value::<ReadyPayload>(data.clone()) {
            Ok(ready) => {
                tracing::info!(session_id = %ready.session_id, version = ?ready.v, "Session ready");
                self.session_id = Some(ready.session_id);
                self.resume_gateway_url = ready.resume_gateway_url;
            }
            Err(e) => {
                tracing::warn!(error = %e, "READY without a usable session id");
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("intents", &self.intents)
            .field("session_id", &self.session_id)
            .field("sequence", &self.sequence.get())
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .finish()
    }
}
