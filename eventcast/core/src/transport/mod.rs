//! Transport Layer for Event Streams
//!
//! Separates the connection manager from the HTTP stack carrying the stream:
//! - [`EventSink`]: what the manager writes frames into
//! - [`ChannelSink`]/[`EventStream`]: in-process channel pair, whose read half
//!   can be served directly as a streaming response body
//! - [`frame`]: the event-stream text framing

pub mod channel;
pub mod frame;
pub mod traits;

// Re-exports for convenience
pub use channel::{ChannelSink, EventStream, SinkState, DEFAULT_STREAM_CAPACITY};
pub use frame::{decode, FrameDecoder, SseFrame};
pub use traits::{ConnectionRequest, EventSink, ResponseHead, TransportError};
