//! Frame decoder for the `zlib-stream` transport
//!
//! Binary frames are fragments of one zlib stream that spans the whole
//! connection. A logical message is complete when a fragment ends with the
//! sync-flush marker; only then is the accumulated buffer inflated and
//! parsed. Text frames are plain JSON and never touch the inflater.

use crate::error::DecodeError;
use crate::protocol::GatewayMessage;
use flate2::{Decompress, FlushDecompress, Status};
use tokio_tungstenite::tungstenite::Message;

/// Trailer of every complete zlib-stream message
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const INFLATE_CHUNK: usize = 16 * 1024;

/// Stateful decoder, one per connection
pub struct FrameDecoder {
    buffer: Vec<u8>,
    inflater: Decompress,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            inflater: Decompress::new(true),
        }
    }

    /// Feed one socket frame
    ///
    /// Returns `Ok(None)` for incomplete compressed fragments and for frames
    /// that carry no payload (ping, pong, close).
    pub fn feed(&mut self, frame: &Message) -> Result<Option<GatewayMessage>, DecodeError> {
        match frame {
            Message::Text(text) => self.feed_text(text).map(Some),
            Message::Binary(bytes) => self.feed_binary(bytes),
            _ => Ok(None),
        }
    }

    pub fn feed_text(&mut self, text: &str) -> Result<GatewayMessage, DecodeError> {
        Ok(GatewayMessage::from_json(text)?)
    }

    pub fn feed_binary(&mut self, fragment: &[u8]) -> Result<Option<GatewayMessage>, DecodeError> {
        self.buffer.extend_from_slice(fragment);

        if !fragment.ends_with(&ZLIB_SUFFIX) {
            tracing::trace!(buffered = self.buffer.len(), "Waiting for zlib sync marker");
            return Ok(None);
        }

        let inflated = self.inflate();
        self.buffer.clear();
        let inflated = inflated?;

        Ok(Some(GatewayMessage::from_slice(&inflated)?))
    }

    /// Number of compressed bytes waiting for a sync marker
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes and start a fresh zlib stream
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.inflater.reset(true);
    }

    fn inflate(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut output = Vec::with_capacity(self.buffer.len().saturating_mul(4));
        let mut offset = 0;

        loop {
            output.reserve(INFLATE_CHUNK);

            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();
            let status = self.inflater.decompress_vec(
                &self.buffer[offset..],
                &mut output,
                FlushDecompress::Sync,
            )?;
            let consumed = (self.inflater.total_in() - before_in) as usize;
            let produced = self.inflater.total_out() - before_out;
            offset += consumed;

            if status == Status::StreamEnd {
                break;
            }

            let input_done = offset >= self.buffer.len();
            if input_done && output.len() < output.capacity() {
                break;
            }
            if consumed == 0 && produced == 0 {
                if input_done {
                    break;
                }
                return Err(DecodeError::Stalled);
            }
        }

        Ok(output)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("pending", &self.buffer.len())
            .field("total_in", &self.inflater.total_in())
            .field("total_out", &self.inflater.total_out())
            .finish()
    }
}
