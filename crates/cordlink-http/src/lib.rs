//! # cordlink-http
//!
//! Request/response client used only to bootstrap gateway connections:
//! it asks the REST API where the gateway lives and how many sessions
//! the bot may still start.

mod client;
mod error;
mod handle;
mod models;

pub use client::{HttpClient, Route, DEFAULT_API_BASE};
pub use error::{HttpError, HttpResult};
pub use handle::HttpHandle;
pub use models::{BotGatewayInfo, GatewayInfo, SessionStartLimit};
