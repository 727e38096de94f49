//! Shared helpers for manager integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use eventcast_core::{
    ChannelSink, ClientId, ConnectionRequest, EventSink, EventStream, FrameDecoder, ManagerConfig,
    ManagerEvent, ResponseHead, SseFrame, SseManager, TransportError,
};
use tokio::sync::broadcast;

/// Channel sink whose writes can be made to fail on demand
#[derive(Debug)]
pub struct FlakySink {
    inner: ChannelSink,
    failing: AtomicBool,
    fail_next: AtomicUsize,
    rejected: AtomicUsize,
}

impl FlakySink {
    pub fn pair(capacity: usize) -> (Arc<Self>, EventStream) {
        let (inner, stream) = ChannelSink::pair(capacity);
        let sink = Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        });
        (sink, stream)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail only the next `writes` writes
    pub fn fail_next(&self, writes: usize) {
        self.fail_next.store(writes, Ordering::SeqCst);
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for FlakySink {
    fn write_head(&self, head: ResponseHead) -> Result<(), TransportError> {
        self.inner.write_head(head)
    }

    async fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        let one_shot = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if one_shot || self.failing.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Backpressure);
        }
        self.inner.write(frame).await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn closed(&self) {
        self.inner.closed().await;
    }

    fn close(&self) {
        self.inner.close();
    }

    fn destroy(&self) {
        self.inner.destroy();
    }
}

/// Route manager logs to the test output (`RUST_LOG` to widen)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("eventcast_core=warn".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

pub fn test_manager() -> SseManager {
    init_tracing();
    SseManager::new(ManagerConfig::for_testing())
}

pub async fn connect(manager: &SseManager) -> (ClientId, EventStream) {
    init_tracing();
    let (sink, stream) = ChannelSink::pair(256);
    let id = manager
        .add_client(&ConnectionRequest::new(), Arc::new(sink))
        .await
        .expect("client should register");
    (id, stream)
}

pub async fn connect_flaky(manager: &SseManager) -> (ClientId, Arc<FlakySink>, EventStream) {
    init_tracing();
    let (sink, stream) = FlakySink::pair(256);
    let id = manager
        .add_client(&ConnectionRequest::new(), Arc::clone(&sink) as Arc<dyn EventSink>)
        .await
        .expect("client should register");
    (id, sink, stream)
}

/// Every complete frame already buffered on `stream`
pub fn drain(stream: &mut EventStream) -> Vec<SseFrame> {
    let mut decoder = FrameDecoder::new();
    while let Some(chunk) = stream.try_recv() {
        decoder.extend(&chunk);
    }
    decoder.frames()
}

/// Buffered frames minus the registration preamble and heartbeats
pub fn drain_payloads(stream: &mut EventStream) -> Vec<SseFrame> {
    drain(stream)
        .into_iter()
        .filter(|f| f.data.is_some())
        .collect()
}

pub fn drain_events(rx: &mut broadcast::Receiver<ManagerEvent>) -> Vec<ManagerEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
