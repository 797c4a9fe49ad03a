use crate::client::HttpClient;
use std::sync::Arc;

/// A REST client reference that remembers who is responsible for closing it
///
/// A gateway client that created its own [`HttpClient`] holds an owned
/// handle and closes it on shutdown. A client handed in by the caller is
/// shared and left open.
#[derive(Debug, Clone)]
pub struct HttpHandle {
    client: Arc<HttpClient>,
    owned: bool,
}

impl HttpHandle {
    /// Wrap a client this handle is responsible for
    pub fn owned(client: HttpClient) -> Self {
        Self {
            client: Arc::new(client),
            owned: true,
        }
    }

    /// Wrap a caller-managed client
    pub fn shared(client: Arc<HttpClient>) -> Self {
        Self {
            client,
            owned: false,
        }
    }

    pub fn client(&self) -> &Arc<HttpClient> {
        &self.client
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Close the client if this handle owns it
    ///
    /// Returns `true` when the underlying client was closed by this call.
    pub fn release(&self) -> bool {
        if !self.owned {
            return false;
        }
        self.client.close()
    }
}
