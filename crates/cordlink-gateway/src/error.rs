//! Gateway error types
//!
//! [`GatewayError`] carries the recovery policy: every variant knows whether
//! the session may be resumed and which code our side closes the socket with.

use crate::protocol::{
    classify_close, CloseCode, CloseDisposition, HEARTBEAT_TIMEOUT_CLOSE, NORMAL_CLOSE,
    RESUMABLE_CLOSE,
};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Frame decoding failures; fatal for the current connection
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Inflate failed: {0}")]
    Inflate(#[from] flate2::DecompressError),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Inflater made no progress")]
    Stalled,
}

/// Gateway client error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport failure on the socket
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Our side of the connection is already closed
    #[error("Connection closed{}", .code.map(|c| format!(" with code {c}")).unwrap_or_default())]
    ConnectionClosed { code: Option<u16> },

    /// `poll_once` called without a live connection
    #[error("Not connected")]
    NotConnected,

    #[error("No frame received within {0:?}")]
    ReadTimeout(Duration),

    #[error("Hello not received within {0:?}")]
    HandshakeTimeout(Duration),

    /// Heartbeat supervisor closed the connection after peer silence
    #[error("Peer stopped responding to heartbeats")]
    HeartbeatTimeout,

    /// Peer closed the socket
    #[error("Closed by peer with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    #[error("Server requested reconnect")]
    ReconnectRequested,

    #[error("Invalid session (resumable: {resumable})")]
    InvalidSession { resumable: bool },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// First message after connect was not Hello
    #[error("Expected Hello as first message, got op {0}")]
    UnexpectedFirstMessage(u8),

    /// Outgoing payload could not be serialized
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Whether the caller should reconnect and resume
    #[must_use]
    pub fn is_reconnectable(&self) -> bool {
        match self {
            Self::Closed { code, .. } => classify_close(*code) == CloseDisposition::Reconnect,
            Self::InvalidSession { resumable } => *resumable,
            Self::Protocol(_) | Self::UnexpectedFirstMessage(_) | Self::Json(_) => false,
            _ => true,
        }
    }

    /// Whether a fresh Identify may follow this fatal error
    #[must_use]
    pub fn allows_reidentify(&self) -> bool {
        matches!(self, Self::InvalidSession { resumable: false })
    }

    /// Code our side closes the socket with after this error
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Self::HeartbeatTimeout => HEARTBEAT_TIMEOUT_CLOSE,
            Self::ReconnectRequested | Self::InvalidSession { resumable: false } => NORMAL_CLOSE,
            _ => RESUMABLE_CLOSE,
        }
    }

    /// Close code reported by the peer, if the peer ended the connection
    #[must_use]
    pub fn peer_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Known gateway close code, when the peer sent one
    #[must_use]
    pub fn gateway_close_code(&self) -> Option<CloseCode> {
        self.peer_code().and_then(CloseCode::from_u16)
    }
}

impl From<tungstenite::Error> for GatewayError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::ConnectionClosed { code: None }
            }
            other => Self::WebSocket(other.to_string()),
        }
    }
}

/// Gateway result type
pub type GatewayResult<T> = Result<T, GatewayError>;
