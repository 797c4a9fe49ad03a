//! Gateway payload fixtures

use cordlink_gateway::protocol::Intents;
use cordlink_gateway::GatewayConfig;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::Write;
use std::time::Duration;

pub const TEST_TOKEN: &str = "test-token";

/// Client config pointed at a mock gateway, with test-friendly timeouts
pub fn test_config(url: &str) -> GatewayConfig {
    let mut config = GatewayConfig::new(url, TEST_TOKEN)
        .with_intents(Intents::GUILDS | Intents::GUILD_MESSAGES);
    config.read_timeout_slack = Duration::from_secs(5);
    config.handshake_timeout = Duration::from_secs(5);
    config
}

pub fn hello(interval_ms: u64) -> Value {
    json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})
}

pub fn ready(seq: u64, session_id: &str) -> Value {
    json!({
        "op": 0,
        "t": "READY",
        "s": seq,
        "d": {
            "v": 9,
            "session_id": session_id,
            "user": {"id": "80351110224678912", "username": "bot"},
            "guilds": []
        }
    })
}

pub fn resumed(seq: u64) -> Value {
    dispatch("RESUMED", seq, json!({}))
}

pub fn dispatch(event: &str, seq: u64, data: Value) -> Value {
    json!({"op": 0, "t": event, "s": seq, "d": data})
}

pub fn heartbeat_ack() -> Value {
    json!({"op": 11})
}

pub fn heartbeat_request() -> Value {
    json!({"op": 1, "d": null})
}

pub fn reconnect() -> Value {
    json!({"op": 7, "d": null})
}

pub fn invalid_session(resumable: bool) -> Value {
    json!({"op": 9, "d": resumable})
}

/// Server side of a zlib-stream transport
pub struct ZlibStream {
    encoder: ZlibEncoder<Vec<u8>>,
}

impl ZlibStream {
    pub fn new() -> Self {
        Self {
            encoder: ZlibEncoder::new(Vec::new(), Compression::default()),
        }
    }

    /// Compress one message and sync-flush, so the output ends in `00 00 FF FF`
    pub fn compress(&mut self, payload: &Value) -> anyhow::Result<Vec<u8>> {
        self.encoder.write_all(payload.to_string().as_bytes())?;
        self.encoder.flush()?;
        Ok(std::mem::take(self.encoder.get_mut()))
    }
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}
