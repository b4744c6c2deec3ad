//! Line codec for the chat protocol
//!
//! Frames a TCP byte stream into newline-terminated UTF-8 lines, parses each
//! line as a [`ClientMessage`], and serializes outgoing [`ServerMessage`]s as
//! one JSON object per line.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::message::{ClientMessage, ServerMessage};

/// Default maximum inbound line length in bytes (excluding the newline).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// One decoded inbound line.
///
/// A line that is not a valid [`ClientMessage`] is still a frame: the stream
/// stays usable and the session decides what to do with it. That covers bad
/// JSON, invalid UTF-8 and lines over the length limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(ClientMessage),
    Malformed { line: String, reason: String },
}

/// A tokio codec for line-delimited JSON.
#[derive(Debug)]
pub struct ChatCodec {
    max_line_length: usize,
    /// Bytes of `src` already scanned for a newline
    next_index: usize,
    /// Skipping the rest of an overlong line
    discarding: bool,
}

impl ChatCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn overlong(&self) -> Frame {
        Frame::Malformed {
            line: String::new(),
            reason: format!("line exceeds maximum length ({} bytes)", self.max_line_length),
        }
    }
}

impl Default for ChatCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

fn parse(bytes: &[u8]) -> Frame {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let line = match std::str::from_utf8(bytes) {
        Ok(line) => line,
        Err(e) => {
            return Frame::Malformed {
                line: String::from_utf8_lossy(bytes).into_owned(),
                reason: e.to_string(),
            }
        }
    };
    match serde_json::from_str::<ClientMessage>(line) {
        Ok(msg) => Frame::Message(msg),
        Err(e) => Frame::Malformed {
            line: line.to_string(),
            reason: e.to_string(),
        },
    }
}

impl Decoder for ChatCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Never scan (or keep) more than one byte past the limit.
            let read_to = src.len().min(self.max_line_length.saturating_add(1));
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match (self.discarding, newline) {
                (true, Some(pos)) => {
                    src.advance(pos + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(self.overlong()));
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(pos)) => {
                    let line = src.split_to(pos + 1);
                    self.next_index = 0;
                    return Ok(Some(parse(&line[..pos])));
                }
                (false, None) if src.len() > self.max_line_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            src.clear();
            return Ok(Some(self.overlong()));
        }
        if src.is_empty() || &src[..] == b"\r" {
            src.clear();
            return Ok(None);
        }
        let line = src.split_to(src.len());
        Ok(Some(parse(&line)))
    }
}

impl Encoder<ServerMessage> for ChatCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // serde_json escapes control characters, so the line holds no raw newline.
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
