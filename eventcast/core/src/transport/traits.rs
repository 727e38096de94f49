//! Transport Traits
//!
//! The seam between the connection manager and whatever HTTP stack carries the
//! event stream. The manager only ever talks to an [`EventSink`]; the HTTP layer
//! decides how the bytes reach the peer.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

/// Errors that can occur while writing to a client transport
#[derive(Debug)]
pub enum TransportError {
    /// The stream was closed (by the manager or because the peer went away)
    Closed,
    /// The stream was forcibly torn down
    Destroyed,
    /// The peer is not draining frames fast enough; the write was dropped
    Backpressure,
    /// IO error from the underlying transport
    Io(std::io::Error),
}

impl TransportError {
    /// Whether the transport can never accept another write
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Destroyed)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Stream closed"),
            Self::Destroyed => write!(f, "Stream destroyed"),
            Self::Backpressure => write!(f, "Stream buffer full"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Status line and headers of an event-stream response
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code
    pub status: u16,
    /// Header name/value pairs, in write order
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// The standard head of an event stream, followed by `extra` headers
    #[must_use]
    pub fn event_stream(extra: &HashMap<String, String>) -> Self {
        let mut headers = vec![
            ("Content-Type".to_string(), "text/event-stream".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("X-Accel-Buffering".to_string(), "no".to_string()),
        ];
        let mut extra: Vec<_> = extra.iter().collect();
        extra.sort();
        headers.extend(extra.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            status: 200,
            headers,
        }
    }

    /// Look up a header value (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The inbound request that opened a stream
///
/// Only what the manager needs: request headers (names lower-cased) and the
/// peer address when the HTTP layer knows it.
#[derive(Clone, Debug, Default)]
pub struct ConnectionRequest {
    headers: HashMap<String, String>,
    peer_addr: Option<SocketAddr>,
}

impl ConnectionRequest {
    /// Create an empty request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request header
    #[must_use]
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Set the peer address
    #[must_use]
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    /// Look up a request header (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The `Last-Event-ID` header sent by a resuming browser
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.header("last-event-id")
    }

    /// The `User-Agent` header
    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// The peer address, if known
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// Write side of one client's event stream
///
/// Implementations must be cheap to call from many tasks; the manager
/// serializes writes per client, but `close`/`destroy` may race with a write.
#[async_trait]
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Set the status line and headers of the response
    ///
    /// May be called again on reconnection; the latest head wins.
    fn write_head(&self, head: ResponseHead) -> Result<(), TransportError>;

    /// Write one encoded frame
    async fn write(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Whether the stream can no longer accept writes
    fn is_closed(&self) -> bool;

    /// Resolve once the stream is closed for any reason
    async fn closed(&self);

    /// End the stream gracefully; already-written frames are still delivered
    fn close(&self);

    /// Tear the stream down immediately
    fn destroy(&self);
}
