//! Payload definitions
//!
//! Handshake payloads the client sends, and the server payloads the session
//! needs to read. Application event bodies stay untyped.

use super::Intents;
use serde::{Deserialize, Serialize};

/// Payload for op 10 (Hello)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// Payload for op 2 (Identify)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub intents: Intents,
    pub properties: IdentifyProperties,

    /// Per-payload compression; unused when the transport is compressed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,

    /// Member count above which offline members are omitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u16>,
}

impl IdentifyPayload {
    #[must_use]
    pub fn new(token: impl Into<String>, intents: Intents, properties: IdentifyProperties) -> Self {
        Self {
            token: token.into(),
            intents,
            properties,
            compress: None,
            large_threshold: None,
        }
    }
}

/// Connection properties reported on Identify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl IdentifyProperties {
    /// Properties for a library, reporting the host operating system
    #[must_use]
    pub fn for_library(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            os: std::env::consts::OS.to_string(),
            browser: name.clone(),
            device: name,
        }
    }

    #[must_use]
    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = os.into();
        self
    }
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self::for_library("cordlink")
    }
}

/// Payload for op 6 (Resume)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    /// Last sequence number received; `null` if no dispatch was seen
    pub seq: Option<u64>,
}

/// The part of the READY dispatch body the session cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    /// Gateway version; some peers leave it out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u8>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_gateway_url: Option<String>,
}
