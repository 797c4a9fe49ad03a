//! Response bodies of the gateway bootstrap endpoints

use serde::{Deserialize, Serialize};

/// `GET /gateway`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    /// Connectable WebSocket URL (without query parameters)
    pub url: String,
}

/// `GET /gateway/bot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotGatewayInfo {
    pub url: String,
    /// Recommended number of shards
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Identify budget for the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    /// Total session starts allowed per window
    pub total: u32,
    /// Session starts left in the current window
    pub remaining: u32,
    /// Milliseconds until the window resets
    pub reset_after: u64,
    /// Identify requests allowed per 5 seconds
    pub max_concurrency: u32,
}

impl SessionStartLimit {
    /// Whether another Identify may be sent in this window
    #[must_use]
    pub fn can_start(&self) -> bool {
        self.remaining > 0
    }
}

impl From<BotGatewayInfo> for GatewayInfo {
    fn from(info: BotGatewayInfo) -> Self {
        Self { url: info.url }
    }
}
