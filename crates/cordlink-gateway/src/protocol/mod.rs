//! Gateway protocol definitions
//!
//! Op codes, close codes, the message envelope and handshake payloads.

mod close_codes;
mod intents;
mod messages;
mod opcodes;
mod payloads;

pub use close_codes::{
    classify_close, CloseCode, CloseDisposition, HEARTBEAT_TIMEOUT_CLOSE, NORMAL_CLOSE,
    RESUMABLE_CLOSE,
};
pub use intents::Intents;
pub use messages::GatewayMessage;
pub use opcodes::OpCode;
pub use payloads::{HelloPayload, IdentifyPayload, IdentifyProperties, ReadyPayload, ResumePayload};
