//! Incremental Server-Sent Events decoder.
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::push`] buffers partial
//! lines and yields a [`RawMessage`] each time a blank line terminates an
//! event block. Only fields present in a block are attached to the message:
//! an `id:` is never inherited from an earlier block.

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::stream::proto::RawMessage;

/// Longest line accepted before the decoder gives up on it.
pub const MAX_LINE_BYTES: usize = 1 << 20;

const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already searched for a line terminator.
    scanned: usize,
    /// Dropping the rest of an oversized line.
    discarding: bool,
    seen_first_line: bool,
    pending: PendingBlock,
}

#[derive(Debug, Default)]
struct PendingBlock {
    id: Option<String>,
    event: Option<String>,
    data: Option<String>,
}

impl PendingBlock {
    fn take_message(&mut self) -> Option<RawMessage> {
        let block = std::mem::take(self);
        let data = block.data?;
        Some(RawMessage {
            id: block.id,
            event: block.event,
            data,
        })
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes and returns every message completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawMessage> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        loop {
            let Some(offset) = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
            else {
                self.scanned = self.buffer.len();
                break;
            };
            let mut line_bytes = self.buffer.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            line_bytes.truncate(line_bytes.len() - 1);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }
            if !self.seen_first_line {
                self.seen_first_line = true;
                if line_bytes.starts_with(BOM) {
                    let _ = line_bytes.split_to(BOM.len());
                }
            }

            let Ok(line) = std::str::from_utf8(&line_bytes) else {
                debug!(event = "sse_line_invalid_utf8", len = line_bytes.len());
                continue;
            };

            if line.is_empty() {
                if let Some(message) = self.pending.take_message() {
                    messages.push(message);
                }
                continue;
            }

            self.apply_line(line);
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            warn!(event = "sse_line_too_long", len = self.buffer.len());
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
            self.seen_first_line = true;
            self.pending = PendingBlock::default();
        }
        messages
    }

    /// Bytes held back waiting for a line terminator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn apply_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => match self.pending.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.pending.data = Some(value.to_string()),
            },
            "id" => {
                // NUL in an id is invalid; the field is ignored.
                if !value.contains('\0') {
                    self.pending.id = Some(value.to_string());
                }
            }
            "event" => self.pending.event = Some(value.to_string()),
            // Reconnect timing is owned by the connection manager.
            "retry" => {}
            other => debug!(event = "sse_field_ignored", field = other),
        }
    }
}
