//! # cordlink-gateway
//!
//! Client for a streaming gateway: zlib-stream framing, heartbeat
//! supervision, identify/resume handshakes and reconnect handling.

pub mod client;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod protocol;
pub mod reconnect;
pub mod runner;
pub mod session;

pub use client::{
    ConnectionState, Dispatcher, GatewayClient, GatewayConfig, GatewayExtension, NoOpExtension,
    PollOutcome,
};
pub use error::{DecodeError, GatewayError, GatewayResult};
pub use reconnect::{ExponentialBackoff, FixedDelay, ReconnectionStrategy};
pub use runner::{drive, run};
pub use session::Session;
