//! SSE (Server-Sent Events) frame parsing for the notification stream
//!
//! Frames are blank-line terminated blocks of `field: value` lines:
//!
//! ```text
//! event: notification
//! data: {"id":"1", ...}
//!
//! ```
//!
//! Field names are matched case-insensitively and surrounding whitespace is
//! tolerated. Multiple `data:` lines are joined with `\n`. LF and CRLF line
//! endings are both accepted. Comments (`:`), `id:` and `retry:` are ignored.
//!
//! A chunk that ends exactly on a newline also terminates the pending frame,
//! so a server that writes one frame per chunk with a single trailing `\n`
//! is still understood.

use bytes::BytesMut;
use serde::Deserialize;
use tracing::{debug, warn};

use super::types::{Notification, StreamEvent};

/// Event type used when a frame carries no `event:` line
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Largest frame (or single line) kept in memory before it is dropped
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One complete frame, before payload decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub event: String,
    pub data: String,
}

/// Incremental frame parser fed with raw body chunks
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences split across chunks decode correctly.
#[derive(Debug)]
pub struct FrameParser {
    /// Bytes after the last complete line
    partial_line: BytesMut,
    event: Option<String>,
    data: String,
    has_data: bool,
    /// Current frame overflowed; skip lines until it ends
    discarding: bool,
    max_frame_bytes: usize,
    bytes_received: usize,
    frames_parsed: usize,
    frames_dropped: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            partial_line: BytesMut::new(),
            event: None,
            data: String::new(),
            has_data: false,
            discarding: false,
            max_frame_bytes,
            bytes_received: 0,
            frames_parsed: 0,
            frames_dropped: 0,
        }
    }

    /// Feed a chunk and return every frame it completes, in wire order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParsedFrame> {
        self.bytes_received += chunk.len();
        self.partial_line.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline_pos) = self.partial_line.iter().position(|&b| b == b'\n') {
            let mut line_bytes = self.partial_line.split_to(newline_pos + 1);
            line_bytes.truncate(line_bytes.len() - 1);
            if line_bytes.last() == Some(&b'\r') {
                line_bytes.truncate(line_bytes.len() - 1);
            }
            let line = String::from_utf8_lossy(&line_bytes);
            if let Some(frame) = self.feed_line(&line) {
                frames.push(frame);
            }
        }

        if self.partial_line.is_empty() {
            // Chunk ended on a newline: that closes the frame too
            if let Some(frame) = self.take_frame() {
                frames.push(frame);
            }
        } else if self.partial_line.len() > self.max_frame_bytes {
            warn!(
                "SSE line exceeds {} bytes without a newline, dropping frame",
                self.max_frame_bytes
            );
            self.partial_line.clear();
            self.drop_frame();
        }
        frames
    }

    /// Flush at end of stream: an unterminated last line and a frame
    /// missing its closing blank line still count.
    pub fn finish(&mut self) -> Option<ParsedFrame> {
        if !self.partial_line.is_empty() {
            let rest = self.partial_line.split();
            let line = String::from_utf8_lossy(&rest);
            if let Some(frame) = self.feed_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.take_frame()
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn frames_parsed(&self) -> usize {
        self.frames_parsed
    }

    /// Frames discarded for exceeding the size limit
    pub fn frames_dropped(&self) -> usize {
        self.frames_dropped
    }

    fn feed_line(&mut self, line: &str) -> Option<ParsedFrame> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return self.take_frame();
        }
        if self.discarding {
            return None;
        }

        if let Some(value) = strip_field(trimmed, "event:") {
            self.event = Some(value.to_string());
        } else if let Some(value) = strip_field(trimmed, "data:") {
            if self.data.is_empty() {
                self.data = value.to_string();
            } else {
                self.data.push('\n');
                self.data.push_str(value);
            }
            self.has_data = true;
            if self.data.len() > self.max_frame_bytes {
                warn!(
                    "SSE frame data exceeds {} bytes, dropping frame",
                    self.max_frame_bytes
                );
                self.drop_frame();
            }
        }
        None
    }

    /// Forget the pending frame and ignore its remaining lines
    fn drop_frame(&mut self) {
        self.event = None;
        self.data = String::new();
        self.has_data = false;
        self.discarding = true;
        self.frames_dropped += 1;
    }

    /// End the current frame; frames without a `data:` line are dropped
    fn take_frame(&mut self) -> Option<ParsedFrame> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        let has_data = std::mem::replace(&mut self.has_data, false);
        self.discarding = false;
        if !has_data {
            return None;
        }
        self.frames_parsed += 1;
        Some(ParsedFrame {
            event: event.unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data,
        })
    }
}

fn strip_field<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let prefix = line.get(..field.len())?;
    if prefix.eq_ignore_ascii_case(field) {
        Some(line[field.len()..].trim())
    } else {
        None
    }
}

/// Parse a single frame block (without its terminating blank line)
pub fn parse_frame(text: &str) -> Option<ParsedFrame> {
    let mut parser = FrameParser::new();
    for line in text.split('\n') {
        if let Some(frame) = parser.feed_line(line.trim_end_matches('\r')) {
            return Some(frame);
        }
    }
    parser.take_frame()
}

#[derive(Debug, Default, Deserialize)]
struct ConnectedPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatPayload {
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Turn a frame into a typed event
///
/// Unknown event types yield `None`. A notification whose payload fails to
/// parse is logged and yields `None`; it never ends the stream.
pub fn decode_event(frame: &ParsedFrame) -> Option<StreamEvent> {
    match frame.event.as_str() {
        "notification" => match serde_json::from_str::<Notification>(&frame.data) {
            Ok(notification) => Some(StreamEvent::Notification(notification)),
            Err(e) => {
                warn!(
                    "Failed to parse notification payload: {} (data: {:.100})",
                    e, frame.data
                );
                None
            }
        },
        "connected" => {
            let payload: ConnectedPayload = serde_json::from_str(&frame.data).unwrap_or_default();
            Some(StreamEvent::Connected {
                message: payload.message,
                user_id: payload.user_id,
            })
        }
        "heartbeat" => {
            let payload: HeartbeatPayload = serde_json::from_str(&frame.data).unwrap_or_default();
            Some(StreamEvent::Heartbeat {
                timestamp: payload.timestamp,
            })
        }
        other => {
            debug!("Ignoring SSE event type '{}'", other);
            None
        }
    }
}
