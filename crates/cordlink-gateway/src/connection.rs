//! Socket writer
//!
//! A [`Connection`] owns the sink half of the socket through a single writer
//! task. Every outbound frame, from the poll loop or the heartbeat supervisor,
//! is handed to that task over a channel, so writes never interleave.

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::GatewayMessage;
use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Upper bound for flushing the close frame before the writer is aborted
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum WriterCommand {
    Send(Message, oneshot::Sender<Result<(), String>>),
    Close(u16),
}

type Writer = (mpsc::UnboundedSender<WriterCommand>, JoinHandle<()>);

/// Write side of one gateway socket
pub struct Connection {
    writer: Mutex<Option<Writer>>,
    closed: watch::Sender<Option<u16>>,
}

impl Connection {
    /// Take ownership of a socket sink and start its writer task
    pub fn spawn<S>(sink: S) -> Arc<Self>
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(sink, receiver));
        let (closed, _) = watch::channel(None);

        Arc::new(Self {
            writer: Mutex::new(Some((commands, handle))),
            closed,
        })
    }

    /// Serialize and send a gateway message
    pub async fn send(&self, message: &GatewayMessage) -> GatewayResult<()> {
        let json = message.to_json()?;
        self.send_frame(Message::Text(json)).await
    }

    /// Send a raw frame and wait until the writer has flushed it
    pub async fn send_frame(&self, frame: Message) -> GatewayResult<()> {
        let commands = self.writer.lock().as_ref().map(|(tx, _)| tx.clone());
        let Some(commands) = commands else {
            return Err(self.closed_error());
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(WriterCommand::Send(frame, reply_tx)).is_err() {
            return Err(self.closed_error());
        }

        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::WebSocket(e)),
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Close the socket with `code`
    ///
    /// Only the first caller tears the writer down and gets `true`; later
    /// and concurrent callers return `false` immediately.
    pub async fn close(&self, code: u16) -> bool {
        let Some((commands, handle)) = self.writer.lock().take() else {
            return false;
        };

        self.closed.send_replace(Some(code));

        if commands.send(WriterCommand::Close(code)).is_err() {
            tracing::debug!(code, "Writer already stopped before close");
        }
        drop(commands);

        let abort = handle.abort_handle();
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Writer task failed"),
            Err(_) => {
                tracing::warn!(code, "Close frame not flushed in time, aborting writer");
                abort.abort();
            }
        }

        tracing::debug!(code, "Connection closed");
        true
    }

    /// Resolves once the connection is closed, with the code it was closed with
    pub async fn closed(&self) -> u16 {
        let mut rx = self.closed.subscribe();
        loop {
            let code = *rx.borrow_and_update();
            if let Some(code) = code {
                return code;
            }
            if rx.changed().await.is_err() {
                return crate::protocol::RESUMABLE_CLOSE;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Code the connection was closed with, if closed
    pub fn close_code(&self) -> Option<u16> {
        *self.closed.borrow()
    }

    fn closed_error(&self) -> GatewayError {
        GatewayError::ConnectionClosed {
            code: self.close_code(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("close_code", &self.close_code())
            .finish()
    }
}

async fn write_loop<S>(mut sink: S, mut commands: mpsc::UnboundedReceiver<WriterCommand>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(frame, reply) => {
                let result = sink.send(frame).await.map_err(|e| e.to_string());
                let failed = result.is_err();
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Failed to write frame");
                }
                let _ = reply.send(result);
                if failed {
                    break;
                }
            }
            WriterCommand::Close(code) => {
                let frame = CloseFrame {
                    code: WsCloseCode::from(code),
                    reason: "".into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(error = %e, code, "Failed to send close frame");
                }
                if let Err(e) = sink.close().await {
                    tracing::debug!(error = %e, "Failed to close sink");
                }
                break;
            }
        }
    }
}
