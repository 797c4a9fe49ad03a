use thiserror::Error;

/// REST bootstrap errors
#[derive(Debug, Error)]
pub enum HttpError {
    /// Transport or body decoding failure
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-2xx response
    #[error("HTTP {status} from {route}: {body}")]
    Status {
        status: u16,
        route: String,
        body: String,
    },

    /// The client was closed before the request was issued
    #[error("HTTP client is closed")]
    Closed,
}

impl HttpError {
    /// Whether the server reported the resource as missing
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    /// Whether the token was rejected
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }
}

/// Result type for REST operations
pub type HttpResult<T> = Result<T, HttpError>;
