//! Scripted servers for end-to-end tests

use crate::fixtures::{self, ZlibStream};
use anyhow::{anyhow, bail, Context};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

/// How long a scripted step waits before the test is considered hung
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Gateway
// ============================================================================

/// WebSocket server that hands each accepted connection to the test
pub struct MockGateway {
    addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<Peer>,
    accept_task: JoinHandle<()>,
}

impl MockGateway {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, peers) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut uri = String::new();
                let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    uri = request.uri().to_string();
                    Ok(response)
                };
                let accepted = accept_hdr_async(stream, callback).await;
                match accepted {
                    Ok(ws) => {
                        if tx.send(Peer::new(ws, uri)).is_err() {
                            break;
                        }
                    }
                    Err(e) => eprintln!("Mock gateway handshake failed: {e}"),
                }
            }
        });

        Ok(Self {
            addr,
            peers,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Wait for the next client connection
    pub async fn accept(&mut self) -> anyhow::Result<Peer> {
        tokio::time::timeout(STEP_TIMEOUT, self.peers.recv())
            .await
            .context("no client connected")?
            .ok_or_else(|| anyhow!("mock gateway stopped accepting"))
    }

    /// Accept a connection, greet it and return the client's handshake packet
    pub async fn accept_with_hello(&mut self, interval_ms: u64) -> anyhow::Result<(Peer, Value)> {
        let mut peer = self.accept().await?;
        peer.send_json(&fixtures::hello(interval_ms)).await?;
        let handshake = peer.recv_json().await?;
        Ok((peer, handshake))
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Server side of one client connection
pub struct Peer {
    ws: WebSocketStream<TcpStream>,
    uri: String,
    compressor: Option<ZlibStream>,
}

impl Peer {
    fn new(ws: WebSocketStream<TcpStream>, uri: String) -> Self {
        Self {
            ws,
            uri,
            compressor: None,
        }
    }

    /// Request URI of the upgrade, including the query string
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn send_json(&mut self, payload: &Value) -> anyhow::Result<()> {
        self.ws.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }

    /// Send a payload on this connection's zlib stream, split into `parts` frames
    pub async fn send_compressed(&mut self, payload: &Value, parts: usize) -> anyhow::Result<()> {
        let bytes = self.compressor.get_or_insert_with(ZlibStream::new).compress(payload)?;
        let chunk = bytes.len().div_ceil(parts.max(1)).max(1);
        for part in bytes.chunks(chunk) {
            self.ws.send(Message::Binary(part.to_vec())).await?;
        }
        Ok(())
    }

    pub async fn send_close(&mut self, code: u16) -> anyhow::Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        self.ws.send(Message::Close(Some(frame))).await?;
        Ok(())
    }

    /// Next JSON payload from the client, skipping control frames
    pub async fn recv_json(&mut self) -> anyhow::Result<Value> {
        loop {
            match self.next_frame().await? {
                Message::Text(text) => return Ok(serde_json::from_str(&text)?),
                Message::Binary(bytes) => return Ok(serde_json::from_slice(&bytes)?),
                Message::Close(frame) => bail!("client closed the connection: {frame:?}"),
                _ => {}
            }
        }
    }

    /// Next payload carrying `op`, discarding anything else
    pub async fn recv_op(&mut self, op: u64) -> anyhow::Result<Value> {
        loop {
            let payload = self.recv_json().await?;
            if payload["op"].as_u64() == Some(op) {
                return Ok(payload);
            }
        }
    }

    /// Read until the client closes; returns the close code it sent
    pub async fn recv_close(&mut self) -> anyhow::Result<Option<u16>> {
        loop {
            match self.next_frame().await {
                Ok(Message::Close(frame)) => return Ok(frame.map(|f| u16::from(f.code))),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    }

    async fn next_frame(&mut self) -> anyhow::Result<Message> {
        tokio::time::timeout(STEP_TIMEOUT, self.ws.next())
            .await
            .context("timed out waiting for a client frame")?
            .ok_or_else(|| anyhow!("client connection ended"))?
            .map_err(Into::into)
    }
}
