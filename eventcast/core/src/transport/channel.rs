//! Channel Transport
//!
//! Channel-backed [`EventSink`] for in-process use. The HTTP layer (or a test)
//! keeps the [`EventStream`] half and forwards its frames as the response body.
//!
//! # Usage
//!
//! ```ignore
//! let (sink, stream) = ChannelSink::pair(256);
//! let client_id = manager.add_client(request, Arc::new(sink)).await?;
//!
//! // Serve `stream` as the response body
//! let body = axum::body::Body::from_stream(stream);
//! ```
//!
//! Dropping the [`EventStream`] counts as the peer going away and resolves
//! [`EventSink::closed`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

use super::traits::{EventSink, ResponseHead, TransportError};

/// Default number of frames buffered per client
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Lifecycle of a channel stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    /// Accepting writes
    Open,
    /// Closed gracefully by the manager
    Closed,
    /// Torn down forcibly
    Destroyed,
    /// The reading half was dropped
    PeerGone,
}

/// Write half of a channel stream
#[derive(Debug)]
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    head: Arc<Mutex<ResponseHead>>,
    state: Arc<watch::Sender<SinkState>>,
}

/// Read half of a channel stream; usable directly as a response body
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Bytes>,
    head: Arc<Mutex<ResponseHead>>,
    state: Arc<watch::Sender<SinkState>>,
    finished: bool,
}

impl ChannelSink {
    /// Create a connected sink/stream pair buffering up to `capacity` frames
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(SinkState::Open);
        let state = Arc::new(state);
        let head = Arc::new(Mutex::new(ResponseHead::default()));

        let sink = Self {
            tx: Mutex::new(Some(tx)),
            head: Arc::clone(&head),
            state: Arc::clone(&state),
        };
        let stream = EventStream {
            rx,
            head,
            state,
            finished: false,
        };

        (sink, stream)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SinkState {
        *self.state.borrow()
    }

    /// Move out of `Open`; the first transition wins
    fn finish(&self, next: SinkState) {
        self.state.send_if_modified(|current| {
            if *current == SinkState::Open {
                *current = next;
                true
            } else {
                false
            }
        });
        // Dropping the sender lets the reader drain and then end.
        self.tx.lock().take();
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    fn write_head(&self, head: ResponseHead) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        *self.head.lock() = head;
        Ok(())
    }

    async fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(match self.state() {
                SinkState::Destroyed => TransportError::Destroyed,
                _ => TransportError::Closed,
            });
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Backpressure),
            Err(TrySendError::Closed(_)) => {
                drop(guard);
                self.finish(SinkState::PeerGone);
                Err(TransportError::Closed)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.state() != SinkState::Open
    }

    async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only errors if it is gone.
        let _ = rx.wait_for(|s| *s != SinkState::Open).await;
    }

    fn close(&self) {
        self.finish(SinkState::Closed);
    }

    fn destroy(&self) {
        self.finish(SinkState::Destroyed);
    }
}

impl EventStream {
    /// The head most recently written by the manager
    #[must_use]
    pub fn head(&self) -> ResponseHead {
        self.head.lock().clone()
    }

    /// Current lifecycle state of the stream
    #[must_use]
    pub fn state(&self) -> SinkState {
        *self.state.borrow()
    }

    /// Receive the next frame, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        let frame = self.rx.recv().await;
        if frame.is_none() {
            self.finished = true;
        }
        frame
    }

    /// Take a frame that is already buffered, without waiting
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(None) => {
                this.finished = true;
                // A destroyed stream ends with an error so the HTTP layer aborts
                // the response instead of finishing it cleanly.
                if *this.state.borrow() == SinkState::Destroyed {
                    Poll::Ready(Some(Err(TransportError::Destroyed)))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.state.send_if_modified(|current| {
            if *current == SinkState::Open {
                *current = SinkState::PeerGone;
                true
            } else {
                false
            }
        });
    }
}
