//! Event-Stream Frames
//!
//! Text framing for the server-push event stream.
//!
//! # Frame Format
//!
//! ```text
//! : comment line            (zero or more)
//! id: 17                    (optional)
//! event: update             (optional)
//! retry: 5000               (optional)
//! data: first payload line  (one per payload line)
//! data: second payload line
//!                           (blank line terminates the frame)
//! ```
//!
//! Compressed payloads carry an `: encoding <algorithm>+base64` comment and a
//! single base64 `data:` line.

use bytes::Bytes;

/// Maximum accepted payload of a single decoded frame (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Comment prefix marking a compressed payload
pub const ENCODING_COMMENT_PREFIX: &str = "encoding ";

/// One event-stream frame
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Comment lines, written before any field
    pub comments: Vec<String>,
    /// `id:` field
    pub id: Option<String>,
    /// `event:` field
    pub event: Option<String>,
    /// `retry:` field in milliseconds
    pub retry: Option<u64>,
    /// Payload, split over `data:` lines on newlines
    pub data: Option<String>,
}

impl SseFrame {
    /// A frame carrying only `data`
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// A frame carrying only a comment
    ///
    /// An empty comment encodes to the bare `:` keep-alive line.
    #[must_use]
    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            comments: vec![text.into()],
            ..Self::default()
        }
    }

    /// Set the `id:` field
    #[must_use]
    pub fn with_id(mut self, id: impl ToString) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Set the `event:` field
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Set the `retry:` field
    #[must_use]
    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// Add a comment line
    #[must_use]
    pub fn with_comment(mut self, text: impl Into<String>) -> Self {
        self.comments.push(text.into());
        self
    }

    /// The algorithm named by an `: encoding <algo>+base64` comment, if any
    #[must_use]
    pub fn encoding(&self) -> Option<&str> {
        self.comments.iter().find_map(|c| {
            c.strip_prefix(ENCODING_COMMENT_PREFIX)
                .and_then(|rest| rest.strip_suffix("+base64"))
        })
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.as_ref().map_or(0, String::len) + 32);

        for comment in &self.comments {
            if comment.is_empty() {
                out.push_str(":\n");
            } else {
                out.push_str(": ");
                out.push_str(comment);
                out.push('\n');
            }
        }
        if let Some(id) = &self.id {
            push_field(&mut out, "id", id);
        }
        if let Some(event) = &self.event {
            push_field(&mut out, "event", event);
        }
        if let Some(retry) = self.retry {
            push_field(&mut out, "retry", &retry.to_string());
        }
        if let Some(data) = &self.data {
            for line in data.split('\n') {
                push_field(&mut out, "data", line.strip_suffix('\r').unwrap_or(line));
            }
        }
        out.push('\n');

        Bytes::from(out)
    }
}

fn push_field(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push('\n');
}

/// Decoder for a stream of event-stream text
///
/// Buffers partial input and yields complete frames, the way a browser's
/// `EventSource` would parse them.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    /// Create a new decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; invalid UTF-8 is replaced
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        if self.buffer.len() > MAX_FRAME_SIZE {
            tracing::warn!(
                buffered = self.buffer.len(),
                max = MAX_FRAME_SIZE,
                "Event-stream buffer exceeded maximum frame size, discarding"
            );
            self.buffer.clear();
        }
    }

    /// Take the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        let end = self.buffer.find("\n\n")?;
        let block: String = self.buffer.drain(..end + 2).collect();
        Some(parse_block(&block))
    }

    /// Drain every complete frame
    pub fn frames(&mut self) -> Vec<SseFrame> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}

/// Decode every complete frame in `text`
#[must_use]
pub fn decode(text: &str) -> Vec<SseFrame> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(text.as_bytes());
    decoder.frames()
}

fn parse_block(block: &str) -> SseFrame {
    let mut frame = SseFrame::default();
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines().filter(|l| !l.is_empty()) {
        if let Some(comment) = line.strip_prefix(':') {
            frame
                .comments
                .push(comment.strip_prefix(' ').unwrap_or(comment).to_string());
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => frame.id = Some(value.to_string()),
            "event" => frame.event = Some(value.to_string()),
            "retry" => frame.retry = value.parse().ok(),
            "data" => data.push(value),
            _ => {}
        }
    }
    if !data.is_empty() {
        frame.data = Some(data.join("\n"));
    }

    frame
}
