//! REST client
//!
//! The underlying `reqwest::Client` is created lazily on the first request
//! and dropped on `close`; requests after `close` fail with [`HttpError::Closed`].

use crate::error::{HttpError, HttpResult};
use crate::models::{BotGatewayInfo, GatewayInfo};
use parking_lot::Mutex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Default REST API root
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v9";

const USER_AGENT: &str = concat!("DiscordBot (cordlink, ", env!("CARGO_PKG_VERSION"), ")");

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A REST endpoint relative to the API root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    path: String,
    auth: bool,
}

impl Route {
    /// Create an authenticated route
    pub fn new(method: Method, path: impl AsRef<str>) -> Self {
        Self {
            method,
            path: format!("/{}", path.as_ref().trim_start_matches('/')),
            auth: true,
        }
    }

    /// Shorthand for a GET route
    pub fn get(path: impl AsRef<str>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Do not send the `Authorization` header for this route
    #[must_use]
    pub fn unauthenticated(mut self) -> Self {
        self.auth = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn requires_auth(&self) -> bool {
        self.auth
    }

    /// Absolute URL under `base`
    pub fn url(&self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.path)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

enum ClientState {
    Idle,
    Open(reqwest::Client),
    Closed,
}

/// Minimal REST client for gateway bootstrap
pub struct HttpClient {
    token: Option<String>,
    base_url: String,
    state: Mutex<ClientState>,
}

impl HttpClient {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            base_url: DEFAULT_API_BASE.to_string(),
            state: Mutex::new(ClientState::Idle),
        }
    }

    /// Point the client at a different API root
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), ClientState::Closed)
    }

    /// Release the underlying session
    ///
    /// Returns `true` only for the call that actually closed the client.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, ClientState::Closed) {
            return false;
        }
        *state = ClientState::Closed;
        tracing::debug!(base_url = %self.base_url, "HTTP client closed");
        true
    }

    fn session(&self) -> HttpResult<reqwest::Client> {
        let mut state = self.state.lock();
        match &*state {
            ClientState::Open(client) => Ok(client.clone()),
            ClientState::Closed => Err(HttpError::Closed),
            ClientState::Idle => {
                let client = reqwest::Client::builder()
                    .user_agent(USER_AGENT)
                    .timeout(REQUEST_TIMEOUT)
                    .build()?;
                *state = ClientState::Open(client.clone());
                Ok(client)
            }
        }
    }

    /// Issue a request and decode a JSON body
    pub async fn request<T: DeserializeOwned>(&self, route: &Route) -> HttpResult<T> {
        let session = self.session()?;

        let mut request = session.request(route.method().clone(), route.url(&self.base_url));
        if route.requires_auth() {
            if let Some(token) = &self.token {
                request = request.header(reqwest::header::AUTHORIZATION, format!("Bot {token}"));
            }
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(route = %route, status = status.as_u16(), "REST request failed");
            return Err(HttpError::Status {
                status: status.as_u16(),
                route: route.to_string(),
                body,
            });
        }

        tracing::trace!(route = %route, status = status.as_u16(), "REST request succeeded");
        Ok(response.json().await?)
    }

    /// Unauthenticated gateway lookup
    pub async fn get_gateway(&self) -> HttpResult<GatewayInfo> {
        self.request(&Route::get("/gateway").unauthenticated()).await
    }

    /// Authenticated gateway lookup with shard and session-start metadata
    pub async fn get_bot_gateway(&self) -> HttpResult<BotGatewayInfo> {
        self.request(&Route::get("/gateway/bot")).await
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
