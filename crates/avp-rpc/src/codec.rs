//! Newline-delimited transport codec for broker messages.
//!
//! The Java brokers write one JSON object per line, terminated by `\n`.
//! This codec frames outbound [`Request`]s the same way and decodes inbound
//! lines into [`Message`]s.
//!
//! Frame format:
//! ```text
//! +------------------+----+
//! |  JSON payload    | \n |
//! +------------------+----+
//! ```

use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Message, Request};

/// Maximum line length (1 MB). A terse status reply is a few hundred bytes;
/// anything near this limit means the peer stopped sending newlines.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Codec for newline-delimited JSON broker messages.
#[derive(Debug, Default)]
pub struct LineDelimitedCodec {
    /// Offset into the buffer already scanned for a newline.
    scanned: usize,
}

impl LineDelimitedCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineDelimitedCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong(src.len()));
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let mut line = src.split_to(self.scanned + pos + 1);
            self.scanned = 0;

            // Strip the delimiter and an optional trailing CR.
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }

            let json_str = std::str::from_utf8(&line)?;
            let message: Message = serde_json::from_str(json_str)?;
            return Ok(Some(message));
        }
    }
}

impl Encoder<Request> for LineDelimitedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        if json.len() > MAX_LINE_LENGTH {
            return Err(CodecError::LineTooLong(json.len()));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');

        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Line too long: {0} bytes (max: {MAX_LINE_LENGTH})")]
    LineTooLong(usize),
}
