//! Connection Manager
//!
//! [`SseManager`] owns the client registry, delivers broadcast and targeted
//! messages, and drives each client through the reconnection state machine.
//!
//! # Locking
//!
//! The registry is a `parking_lot::RwLock` that is never held across an await.
//! Each client lives behind its own `tokio::sync::Mutex`; every mutation of a
//! client (writes, sweeps, reconnection) happens while holding it, so a client
//! only ever has one writer at a time. Code that looked a client up and then
//! waited for its lock re-checks that it is still registered before acting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::{history_entry, Client, ClientId, ClientSnapshot};
use crate::compression::{self, CompressionStats};
use crate::config::ManagerConfig;
use crate::error::{ClientFailure, ManagerError, WriteError};
use crate::events::{CleanupReason, ManagerEvent, EVENT_CHANNEL_CAPACITY};
use crate::message::{render_data, MessageId, OutboundMessage};
use crate::quality::{calculate_quality, ConnectionQuality};
use crate::queue::EnqueueOutcome;
use crate::reconnect::backoff_delay;
use crate::sweeps::{self, SweepHandles, SweepKind};
use crate::transport::frame::ENCODING_COMMENT_PREFIX;
use crate::transport::{ConnectionRequest, EventSink, ResponseHead, SseFrame, TransportError};

/// Payload of the frame written right after registration
pub const CONNECTED_PAYLOAD: &str = "\"connected\"";

/// Event name of the frame written when a connection is restored
pub const RECONNECT_EVENT: &str = "reconnect";

pub(crate) type ClientCell = AsyncMutex<Client>;

/// Result of broadcasting a message to all clients
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastResult {
    /// Number of clients that received the frame
    pub successful: usize,
    /// Number of clients whose write failed
    pub failed: usize,
    /// Clients whose write failed
    pub failed_ids: Vec<ClientId>,
}

impl BroadcastResult {
    /// Check if every connected client received the frame
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Total clients attempted
    #[must_use]
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }
}

enum DeliveryStatus {
    Delivered,
    /// Client not in a state to receive; nothing was attempted
    Skipped,
    Failed(WriteError),
}

struct WriteReport {
    status: DeliveryStatus,
    compression: Option<CompressionStats>,
}

impl WriteReport {
    fn skipped() -> Self {
        Self {
            status: DeliveryStatus::Skipped,
            compression: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum FlushMode {
    /// Due, non-exhausted messages
    Retry,
    /// Everything above the watermark after a reconnection
    Replay,
}

#[derive(Default)]
struct FlushReport {
    delivered: Vec<MessageId>,
    failure: Option<WriteError>,
}

/// Server-sent-events connection manager
///
/// Cheap to clone; all clones share one registry. Must be created inside a
/// tokio runtime because it spawns its sweeps immediately.
#[derive(Clone)]
pub struct SseManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    config: ManagerConfig,
    clients: RwLock<HashMap<ClientId, Arc<ClientCell>>>,
    events: broadcast::Sender<ManagerEvent>,
    sweeps: Mutex<Option<SweepHandles>>,
    shut_down: AtomicBool,
}

impl fmt::Debug for SseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseManager")
            .field("clients", &self.client_count())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl SseManager {
    /// Create a manager and start its sweeps
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(ManagerInner {
            config,
            clients: RwLock::new(HashMap::new()),
            events,
            sweeps: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let handles = sweeps::spawn_sweeps(&inner);
        *inner.sweeps.lock() = Some(handles);

        let config = &inner.config;
        info!(
            heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
            cleanup_interval_ms = config.cleanup_interval.as_millis() as u64,
            max_clients = config.max_concurrent_clients,
            compression = config.enable_compression,
            "SSE manager initialized"
        );

        Self { inner }
    }

    /// The configuration this manager runs with
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Register a client and write the stream preamble
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::CapacityExceeded` when `max_concurrent_clients`
    /// are registered, or `ManagerError::ShutDown` after [`shutdown`](Self::shutdown).
    pub async fn add_client(
        &self,
        request: &ConnectionRequest,
        sink: Arc<dyn EventSink>,
    ) -> Result<ClientId, ManagerError> {
        self.inner.add_client(request, sink).await
    }

    /// Accept an incoming stream request
    ///
    /// Same as [`add_client`](Self::add_client) with connection logging.
    ///
    /// # Errors
    ///
    /// See [`add_client`](Self::add_client).
    pub async fn handle_connection(
        &self,
        request: &ConnectionRequest,
        sink: Arc<dyn EventSink>,
    ) -> Result<ClientId, ManagerError> {
        debug!(
            peer = ?request.peer_addr(),
            user_agent = request.user_agent().unwrap_or("-"),
            last_event_id = request.last_event_id().unwrap_or("-"),
            "Incoming event-stream connection"
        );
        match self.add_client(request, sink).await {
            Ok(id) => {
                info!(
                    client_id = %id,
                    total_clients = self.client_count(),
                    "Event-stream connection established"
                );
                Ok(id)
            }
            Err(e) => {
                warn!(error = %e, "Event-stream connection rejected");
                Err(e)
            }
        }
    }

    /// Queue a message for one client and try to deliver it now
    ///
    /// Returns `true` only if the message reached the transport during this
    /// call. A `false` return for a known client means the message stays
    /// queued for the retry sweep (unless the queue rejected it).
    pub async fn send_to_client(&self, id: &ClientId, message: OutboundMessage) -> bool {
        self.inner.send_to_client(id, message).await
    }

    /// Send a message to every connected client, best effort
    ///
    /// The frame carries the JSON of `message` with no `id:` or `event:`.
    /// Failures are counted, never queued.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> BroadcastResult {
        match serde_json::to_string(message) {
            Ok(data) => self.inner.broadcast(SseFrame::data(data)).await,
            Err(e) => {
                error!(error = %e, "Failed to serialize broadcast message");
                BroadcastResult::default()
            }
        }
    }

    /// Remove a client and close its stream
    ///
    /// Returns `false` if the client was not registered.
    pub async fn disconnect_client(&self, id: &ClientId) -> bool {
        self.inner.disconnect_client(id).await
    }

    /// Tear down a client's transport immediately, then remove it
    pub async fn destroy_client(&self, id: &ClientId) {
        self.inner.destroy_client(id).await;
    }

    /// Number of registered clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.client_count()
    }

    /// Ids of all registered clients
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.inner.clients.read().keys().cloned().collect()
    }

    /// Diagnostic view of one client
    pub async fn client_snapshot(&self, id: &ClientId) -> Option<ClientSnapshot> {
        let cell = self.inner.lookup(id)?;
        let client = cell.lock().await;
        Some(client.snapshot())
    }

    /// Diagnostic views of all clients
    pub async fn client_snapshots(&self) -> Vec<ClientSnapshot> {
        let mut snapshots = Vec::new();
        for cell in self.inner.client_cells() {
            let client = cell.lock().await;
            if self.inner.is_registered(&client.id) {
                snapshots.push(client.snapshot());
            }
        }
        snapshots
    }

    /// Report inbound traffic from a client (heartbeat acks, posts)
    ///
    /// Returns `false` for an unknown client.
    pub async fn record_client_activity(&self, id: &ClientId, bytes: usize) -> bool {
        let Some(cell) = self.inner.lookup(id) else {
            return false;
        };
        let mut client = cell.lock().await;
        client.record_inbound(bytes);
        trace!(client_id = %id, bytes, "Client activity recorded");
        true
    }

    /// Set a response header re-issued whenever the client's stream is restored
    pub async fn set_custom_header(
        &self,
        id: &ClientId,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        let Some(cell) = self.inner.lookup(id) else {
            return false;
        };
        let mut client = cell.lock().await;
        client.state.custom_headers.insert(name.into(), value.into());
        true
    }

    /// Subscribe to manager events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Run the retry sweep once
    pub async fn run_retry_sweep(&self) {
        self.inner.run_sweep(SweepKind::Retry).await;
    }

    /// Run the quality sweep once
    pub async fn run_quality_sweep(&self) {
        self.inner.run_sweep(SweepKind::Quality).await;
    }

    /// Run the cleanup sweep once
    pub async fn run_cleanup_sweep(&self) {
        self.inner.run_sweep(SweepKind::Cleanup).await;
    }

    /// Run the heartbeat sweep once
    pub async fn run_heartbeat_sweep(&self) {
        self.inner.run_sweep(SweepKind::Heartbeat).await;
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop all sweeps and disconnect every client
    ///
    /// Idempotent. New registrations are refused afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    /// Shut down when the process receives SIGINT or SIGTERM
    pub fn shutdown_on_signal(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            wait_for_termination().await;
            manager.shutdown().await;
        })
    }
}

impl ManagerInner {
    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn lookup(&self, id: &ClientId) -> Option<Arc<ClientCell>> {
        self.clients.read().get(id).cloned()
    }

    fn is_registered(&self, id: &ClientId) -> bool {
        self.clients.read().contains_key(id)
    }

    fn client_cells(&self) -> Vec<Arc<ClientCell>> {
        self.clients.read().values().cloned().collect()
    }

    fn unregister(&self, id: &ClientId) -> Option<Arc<ClientCell>> {
        self.clients.write().remove(id)
    }

    fn try_register(&self, id: &ClientId, cell: &Arc<ClientCell>) -> Result<(), ManagerError> {
        let mut clients = self.clients.write();
        let limit = self.config.max_concurrent_clients;
        if clients.len() >= limit {
            warn!(limit, "Client limit reached, rejecting connection");
            return Err(ManagerError::CapacityExceeded { limit });
        }
        clients.insert(id.clone(), Arc::clone(cell));
        Ok(())
    }

    // =========================================================================
    // Registration & teardown
    // =========================================================================

    async fn add_client(
        self: &Arc<Self>,
        request: &ConnectionRequest,
        sink: Arc<dyn EventSink>,
    ) -> Result<ClientId, ManagerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ManagerError::ShutDown);
        }

        let id = ClientId::new();
        let cell = Arc::new(AsyncMutex::new(Client::new(
            id.clone(),
            Arc::clone(&sink),
            request,
            &self.config,
        )));

        // Held until the preamble is out so no broadcast can overtake it.
        let client = Arc::clone(&cell).lock_owned().await;
        self.try_register(&id, &cell)?;

        if let Err(e) = sink.write_head(ResponseHead::event_stream(&client.state.custom_headers)) {
            debug!(client_id = %id, error = %e, "Failed to write response head");
        }
        for frame in [SseFrame::comment(""), SseFrame::data(CONNECTED_PAYLOAD)] {
            if let Err(e) = sink.write(frame.encode()).await {
                debug!(client_id = %id, error = %e, "Failed to write stream preamble");
                break;
            }
        }
        drop(client);

        self.spawn_close_listener(id.clone(), sink);
        self.emit(ManagerEvent::ClientConnected {
            client_id: id.clone(),
        });
        info!(
            client_id = %id,
            total_clients = self.client_count(),
            "Client registered"
        );

        Ok(id)
    }

    fn spawn_close_listener(self: &Arc<Self>, id: ClientId, sink: Arc<dyn EventSink>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            sink.closed().await;
            if let Some(manager) = manager.upgrade() {
                manager.on_transport_closed(&id).await;
            }
        });
    }

    async fn on_transport_closed(&self, id: &ClientId) {
        let Some(cell) = self.unregister(id) else {
            return;
        };
        let mut client = cell.lock().await;
        debug!(client_id = %id, "Transport closed");
        self.finish_disconnect(&mut client);
    }

    /// Shared tail of every removal path; the client is already unregistered
    fn finish_disconnect(&self, client: &mut Client) {
        client.connected = false;
        client.state.is_backoff = false;
        client.state.backoff_until = None;
        client.sink.close();

        info!(
            client_id = %client.id,
            remaining_clients = self.client_count(),
            "Client disconnected"
        );
        self.emit(ManagerEvent::ClientDisconnected {
            client_id: client.id.clone(),
        });
    }

    /// Remove a client whose lock the caller holds; `false` if already gone
    fn remove_locked(&self, client: &mut Client) -> bool {
        if self.unregister(&client.id).is_none() {
            return false;
        }
        self.finish_disconnect(client);
        true
    }

    async fn disconnect_client(&self, id: &ClientId) -> bool {
        let Some(cell) = self.unregister(id) else {
            debug!(client_id = %id, "Disconnect requested for unknown client");
            return false;
        };
        let mut client = cell.lock().await;
        self.finish_disconnect(&mut client);
        true
    }

    async fn destroy_client(&self, id: &ClientId) {
        let Some(cell) = self.lookup(id) else {
            return;
        };
        let sink = Arc::clone(&cell.lock().await.sink);
        warn!(client_id = %id, "Destroying client transport");
        sink.destroy();
        self.disconnect_client(id).await;
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("SSE manager already shut down");
            return;
        }
        info!(clients = self.client_count(), "Shutting down SSE manager");

        let handles = self.sweeps.lock().take();
        if let Some(handles) = handles {
            handles.abort_all();
        }

        let cells: Vec<_> = self.clients.write().drain().map(|(_, cell)| cell).collect();
        for cell in cells {
            let mut client = cell.lock().await;
            self.finish_disconnect(&mut client);
        }

        info!("SSE manager shutdown complete");
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    async fn send_to_client(self: &Arc<Self>, id: &ClientId, message: OutboundMessage) -> bool {
        let Some(cell) = self.lookup(id) else {
            debug!(client_id = %id, "Send to unknown client");
            return false;
        };
        let mut client = cell.lock().await;
        if !self.is_registered(id) {
            return false;
        }

        let queued_id = match client.message_queue.push(message, Instant::now()) {
            EnqueueOutcome::Queued(queued) => queued,
            EnqueueOutcome::QueuedWithEviction { id: queued, evicted } => {
                debug!(
                    client_id = %id,
                    evicted = %evicted,
                    "Message queue full, evicted oldest message"
                );
                queued
            }
            EnqueueOutcome::Rejected => {
                warn!(
                    client_id = %id,
                    queue_size = client.message_queue.current_size(),
                    "Message queue full of high-priority messages, message dropped"
                );
                return false;
            }
        };

        if !client.connected || client.state.is_backoff {
            debug!(
                client_id = %id,
                message_id = %queued_id,
                "Client unavailable, message queued for retry"
            );
            return false;
        }

        let report = self.flush_queue(&mut client, FlushMode::Retry).await;
        let Some(err) = report.failure else {
            return report.delivered.contains(&queued_id);
        };
        self.handle_client_error(&cell, &mut client, ClientFailure::Write(err))
            .await;

        // An immediate reconnect may have replayed the message.
        !client.message_queue.contains(queued_id)
            && client.state.last_message_id >= Some(queued_id)
    }

    async fn broadcast(&self, frame: SseFrame) -> BroadcastResult {
        let mut result = BroadcastResult::default();

        for cell in self.client_cells() {
            let mut client = cell.lock().await;
            if !client.connected || !self.is_registered(&client.id) {
                continue;
            }
            match self.send_message_to_client(&mut client, &frame, None, None).await {
                Ok(()) => result.successful += 1,
                Err(e) => {
                    warn!(client_id = %client.id, error = %e, "Broadcast delivery failed");
                    result.failed += 1;
                    result.failed_ids.push(client.id.clone());
                }
            }
        }

        debug!(
            successful = result.successful,
            failed = result.failed,
            "Broadcast complete"
        );
        result
    }

    /// Deliver queued messages in id order, stopping at the first failure
    async fn flush_queue(&self, client: &mut Client, mode: FlushMode) -> FlushReport {
        let now = Instant::now();
        let watermark = client.state.last_message_id;
        let ids = match mode {
            FlushMode::Retry => client.message_queue.retry_candidates(watermark, now),
            FlushMode::Replay => client.message_queue.replay_candidates(watermark, now),
        };

        let mut report = FlushReport::default();
        for id in ids {
            let Some(queued) = client.message_queue.get(id) else {
                continue;
            };
            let frame = PendingFrame {
                id,
                event: queued.event.clone(),
                data: queued.data.clone(),
            };

            let write = self.write_to_client(client, &frame).await;
            match write.status {
                DeliveryStatus::Delivered => {
                    client.advance_watermark(id);
                    client.message_queue.remove(id);
                    report.delivered.push(id);
                }
                DeliveryStatus::Skipped => break,
                DeliveryStatus::Failed(err) => {
                    let retry_cap = self.config.message_retry_interval;
                    if let Some(msg) = client.message_queue.get_mut(id) {
                        msg.record_failure(now, retry_cap);
                        msg.compressed = write.compression.is_some();
                        msg.compression_stats = write.compression;
                    }
                    if client.message_queue.mark_exhaustion_logged(id) {
                        error!(
                            client_id = %client.id,
                            message_id = %id,
                            attempts = client.message_queue.max_attempts(),
                            error = %err,
                            "Failed to deliver message after max attempts"
                        );
                    } else {
                        debug!(
                            client_id = %client.id,
                            message_id = %id,
                            ?mode,
                            error = %err,
                            "Delivery failed, message kept for retry"
                        );
                    }
                    report.failure = Some(err);
                    break;
                }
            }
        }
        report
    }

    /// Serialize, maybe compress, and write one queued message
    async fn write_to_client(&self, client: &mut Client, message: &PendingFrame) -> WriteReport {
        if !client.connected || client.state.is_backoff {
            trace!(client_id = %client.id, "Client not writable, skipping");
            return WriteReport::skipped();
        }

        let payload = match render_data(&message.data) {
            Ok(payload) => payload,
            Err(e) => {
                error!(client_id = %client.id, error = %e, "Failed to serialize message");
                return WriteReport {
                    status: DeliveryStatus::Failed(e.into()),
                    compression: None,
                };
            }
        };

        let (mut frame, compression) = self.encode_payload(client, payload);
        frame.id = Some(message.id.to_string());
        frame.event.clone_from(&message.event);

        let status = match self
            .send_message_to_client(client, &frame, Some(message.id), compression.as_ref())
            .await
        {
            Ok(()) => {
                if let Some(stats) = &compression {
                    client.message_queue.compression_stats.record(stats);
                }
                DeliveryStatus::Delivered
            }
            Err(e) => DeliveryStatus::Failed(e.into()),
        };
        WriteReport {
            status,
            compression,
        }
    }

    /// Build the data frame, compressing when it pays off
    fn encode_payload(
        &self,
        client: &Client,
        payload: String,
    ) -> (SseFrame, Option<CompressionStats>) {
        let config = &self.config;
        if !config.enable_compression
            || !client.state.features.supports_compression
            || payload.len() <= config.compression_min_size
        {
            return (SseFrame::data(payload), None);
        }

        let algorithm = if config.auto_select_compression {
            compression::select_algorithm(payload.as_bytes())
        } else {
            config.compression_algorithm
        };

        match compression::compress_if_smaller(algorithm, payload.as_bytes()) {
            Ok(Some(compressed)) => {
                trace!(
                    client_id = %client.id,
                    algorithm = %algorithm,
                    original_size = compressed.stats.original_size,
                    compressed_size = compressed.stats.compressed_size,
                    "Payload compressed"
                );
                let frame = SseFrame::data(BASE64.encode(&compressed.bytes))
                    .with_comment(format!("{ENCODING_COMMENT_PREFIX}{algorithm}+base64"));
                (frame, Some(compressed.stats))
            }
            Ok(None) => (SseFrame::data(payload), None),
            Err(e) => {
                warn!(
                    client_id = %client.id,
                    algorithm = %algorithm,
                    error = %e,
                    "Compression failed, sending uncompressed"
                );
                (SseFrame::data(payload), None)
            }
        }
    }

    /// Write a frame and update metrics; no state checks
    async fn send_message_to_client(
        &self,
        client: &mut Client,
        frame: &SseFrame,
        message_id: Option<MessageId>,
        compression: Option<&CompressionStats>,
    ) -> Result<(), TransportError> {
        let bytes = frame.encode();
        let len = bytes.len();
        let started = Instant::now();

        match client.sink.write(bytes).await {
            Ok(()) => {
                let entry = history_entry(
                    message_id,
                    frame.event.as_deref(),
                    frame.data.as_deref().unwrap_or_default(),
                    compression,
                );
                client.record_delivery(len, started.elapsed(), entry);
                trace!(client_id = %client.id, bytes = len, "Frame written");
                Ok(())
            }
            Err(e) => {
                if e.is_terminal() && client.connected {
                    client.connected = false;
                    debug!(client_id = %client.id, "Transport gone, client marked disconnected");
                }
                Err(e)
            }
        }
    }

    async fn send_heartbeat(&self, client: &mut Client) -> Result<(), TransportError> {
        let frame = SseFrame::comment(format!("heartbeat {}", Utc::now().to_rfc3339()));
        let bytes = frame.encode();
        let len = bytes.len();

        match client.sink.write(bytes).await {
            Ok(()) => {
                client.record_heartbeat(len);
                trace!(client_id = %client.id, "Heartbeat sent");
                Ok(())
            }
            Err(e) => {
                if e.is_terminal() {
                    client.connected = false;
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Error path & reconnection
    // =========================================================================

    async fn handle_client_error(
        self: &Arc<Self>,
        cell: &Arc<ClientCell>,
        client: &mut Client,
        failure: ClientFailure,
    ) {
        let mut failure = failure;
        loop {
            client.state.metrics.error_count += 1;
            client.state.consecutive_failures += 1;

            error!(
                client_id = %client.id,
                error = %failure,
                quality = %client.state.connection_quality,
                consecutive_failures = client.state.consecutive_failures,
                last_message_id = ?client.state.last_message_id,
                messages_sent = client.state.metrics.messages_sent,
                error_count = client.state.metrics.error_count,
                "Client error"
            );
            self.emit(ManagerEvent::ClientError {
                client_id: client.id.clone(),
                error: failure.to_string(),
                quality: client.state.connection_quality,
                consecutive_failures: client.state.consecutive_failures,
                last_message_id: client.state.last_message_id,
                metrics: client.state.metrics.clone(),
            });

            if client.state.consecutive_failures >= client.max_reconnect_attempts {
                error!(
                    client_id = %client.id,
                    max_attempts = client.max_reconnect_attempts,
                    "Client exceeded max reconnection attempts, disconnecting"
                );
                let metrics = client.state.metrics.clone();
                if self.remove_locked(client) {
                    self.emit(ManagerEvent::ClientCleanup {
                        client_id: client.id.clone(),
                        reason: CleanupReason::Failed,
                        metrics,
                    });
                }
                return;
            }

            let delay = backoff_delay(client.state.consecutive_failures);
            if delay.is_zero() {
                if self.attempt_reconnect(client).await {
                    client.state.consecutive_failures = 0;
                    return;
                }
                failure = ClientFailure::ReconnectFailed;
                continue;
            }

            let deadline = Instant::now() + delay;
            client.state.is_backoff = true;
            client.state.backoff_until = Some(deadline);
            warn!(
                client_id = %client.id,
                backoff_ms = delay.as_millis() as u64,
                consecutive_failures = client.state.consecutive_failures,
                "Client entering backoff"
            );
            self.schedule_reconnect(Arc::clone(cell), deadline);
            return;
        }
    }

    /// Spawn the reconnect that ends a backoff at `deadline`
    ///
    /// Stale timers (the client was removed, or a newer backoff replaced this
    /// one) do nothing.
    fn schedule_reconnect(self: &Arc<Self>, cell: Arc<ClientCell>, deadline: Instant) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let mut client = cell.lock().await;
            if !manager.is_registered(&client.id) || client.state.backoff_until != Some(deadline)
            {
                return;
            }

            client.state.is_backoff = false;
            client.state.backoff_until = None;
            if manager.attempt_reconnect(&mut client).await {
                client.state.consecutive_failures = 0;
            } else {
                manager
                    .handle_client_error(&cell, &mut client, ClientFailure::ReconnectFailed)
                    .await;
            }
        });
    }

    async fn attempt_reconnect(&self, client: &mut Client) -> bool {
        if client.state.is_reconnecting {
            return false;
        }
        client.state.is_reconnecting = true;
        client.state.last_reconnect_attempt = Some(Instant::now());
        client.reconnect_attempts += 1;

        info!(
            client_id = %client.id,
            attempt = client.reconnect_attempts,
            max_attempts = client.max_reconnect_attempts,
            "Attempting to reconnect client"
        );

        let restored = self.restore_connection(client).await;
        if restored {
            self.replay_missed_messages(client).await;
            client.reconnect_attempts = 0;
            client.state.last_reconnect_attempt = None;
            info!(client_id = %client.id, "Client reconnected");
            self.emit(ManagerEvent::ClientReconnected {
                client_id: client.id.clone(),
                last_message_id: client.state.last_message_id,
            });
        } else {
            warn!(client_id = %client.id, "Reconnection attempt failed");
        }
        client.state.is_reconnecting = false;
        restored
    }

    async fn restore_connection(&self, client: &mut Client) -> bool {
        if client.sink.is_closed() {
            debug!(client_id = %client.id, "Transport closed, cannot restore");
            return false;
        }
        if let Err(e) = client
            .sink
            .write_head(ResponseHead::event_stream(&client.state.custom_headers))
        {
            warn!(client_id = %client.id, error = %e, "Failed to re-issue response head");
            return false;
        }

        let payload = json!({
            "lastMessageId": client.state.last_message_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let mut frame = SseFrame::data(payload.to_string()).with_event(RECONNECT_EVENT);
        if client.state.features.supports_retry {
            let retry_ms = u64::try_from(client.reconnect_delay.as_millis()).unwrap_or(u64::MAX);
            frame = frame.with_retry(retry_ms);
        }
        if let Err(e) = self.send_message_to_client(client, &frame, None, None).await {
            warn!(client_id = %client.id, error = %e, "Failed to send reconnect event");
            return false;
        }

        let now = Instant::now();
        client.connected = true;
        client.last_activity = now;
        client.state.last_heartbeat = Some(now);
        if let Err(e) = self.send_heartbeat(client).await {
            debug!(client_id = %client.id, error = %e, "Heartbeat after restore failed");
        }
        true
    }

    async fn replay_missed_messages(&self, client: &mut Client) {
        let report = self.flush_queue(client, FlushMode::Replay).await;
        if !report.delivered.is_empty() {
            info!(
                client_id = %client.id,
                replayed = report.delivered.len(),
                last_message_id = ?client.state.last_message_id,
                "Replayed missed messages"
            );
        }
        if let Some(e) = report.failure {
            warn!(client_id = %client.id, error = %e, "Replay stopped at failed message");
        }
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    pub(crate) async fn run_sweep(self: &Arc<Self>, kind: SweepKind) {
        match kind {
            SweepKind::Cleanup => self.cleanup_disconnected_clients().await,
            SweepKind::Retry => self.retry_failed_messages().await,
            SweepKind::Quality => self.monitor_connection_quality().await,
            SweepKind::Heartbeat => self.send_heartbeats().await,
        }
    }

    async fn retry_failed_messages(self: &Arc<Self>) {
        let now = Instant::now();
        for cell in self.client_cells() {
            let mut client = cell.lock().await;
            if !self.is_registered(&client.id) || !client.connected || client.state.is_backoff {
                continue;
            }

            let purged = client.message_queue.purge_expired(now);
            if purged > 0 {
                debug!(client_id = %client.id, purged, "Purged expired messages");
            }
            if client.message_queue.is_empty() {
                continue;
            }

            let report = self.flush_queue(&mut client, FlushMode::Retry).await;
            if !report.delivered.is_empty() || report.failure.is_some() {
                debug!(
                    client_id = %client.id,
                    delivered = report.delivered.len(),
                    failed = report.failure.is_some(),
                    remaining = client.message_queue.current_size(),
                    "Retry sweep processed client"
                );
            }
        }
    }

    async fn monitor_connection_quality(self: &Arc<Self>) {
        for cell in self.client_cells() {
            let mut client = cell.lock().await;
            if !self.is_registered(&client.id) || !client.connected {
                continue;
            }

            let since_heartbeat = client.state.last_heartbeat.map(|t| t.elapsed());
            let old_quality = client.state.connection_quality;
            let new_quality = calculate_quality(&client.state.metrics, since_heartbeat);
            client.state.connection_quality = new_quality;

            if old_quality != new_quality {
                info!(
                    client_id = %client.id,
                    old_quality = %old_quality,
                    new_quality = %new_quality,
                    "Connection quality changed"
                );
                self.emit(ManagerEvent::ConnectionQualityChange {
                    client_id: client.id.clone(),
                    old_quality,
                    new_quality,
                    metrics: client.state.metrics.clone(),
                });
            }

            if new_quality == ConnectionQuality::Poor
                && !client.state.is_backoff
                && !client.state.is_reconnecting
            {
                warn!(client_id = %client.id, "Poor connection quality detected");
                self.handle_client_error(&cell, &mut client, ClientFailure::PoorQuality)
                    .await;
            }
        }
    }

    async fn cleanup_disconnected_clients(&self) {
        let now = Instant::now();
        let timeout = self.config.client_timeout;
        let (mut active, mut reconnecting) = (0usize, 0usize);

        for cell in self.client_cells() {
            let mut client = cell.lock().await;
            if !self.is_registered(&client.id) {
                continue;
            }

            let inactive = now.saturating_duration_since(client.last_activity) > timeout;
            let failed = client.state.consecutive_failures >= client.max_reconnect_attempts
                || (client.state.connection_quality == ConnectionQuality::Poor
                    && !client.state.is_reconnecting);
            let evict = !client.connected || inactive || failed;
            let recovering = client.state.is_reconnecting
                && client.reconnect_attempts < client.max_reconnect_attempts;

            if !evict || recovering {
                if client.state.is_reconnecting || client.state.is_backoff {
                    reconnecting += 1;
                } else {
                    active += 1;
                }
                continue;
            }

            let reason = if inactive {
                CleanupReason::Inactive
            } else if failed {
                CleanupReason::Failed
            } else {
                CleanupReason::Disconnected
            };
            info!(
                client_id = %client.id,
                ?reason,
                consecutive_failures = client.state.consecutive_failures,
                quality = %client.state.connection_quality,
                "Cleaning up client"
            );
            let metrics = client.state.metrics.clone();
            if self.remove_locked(&mut client) {
                self.emit(ManagerEvent::ClientCleanup {
                    client_id: client.id.clone(),
                    reason,
                    metrics,
                });
            }
        }

        debug!(
            active,
            reconnecting,
            total = self.client_count(),
            "SSE manager status"
        );
    }

    async fn send_heartbeats(&self) {
        for cell in self.client_cells() {
            let mut client = cell.lock().await;
            if !self.is_registered(&client.id) || !client.connected || client.state.is_backoff {
                continue;
            }
            if let Err(e) = self.send_heartbeat(&mut client).await {
                warn!(client_id = %client.id, error = %e, "Heartbeat failed");
            }
        }
    }
}

/// A queued message on its way to the wire
struct PendingFrame {
    id: MessageId,
    event: Option<String>,
    data: serde_json::Value,
}

/// Resolve on SIGINT, or SIGTERM on unix
async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::{ChannelSink, EventStream, FrameDecoder};

    fn manager(config: ManagerConfig) -> SseManager {
        SseManager::new(config)
    }

    async fn connect(manager: &SseManager) -> (ClientId, EventStream) {
        let (sink, stream) = ChannelSink::pair(64);
        let id = manager
            .add_client(&ConnectionRequest::new(), Arc::new(sink))
            .await
            .unwrap();
        (id, stream)
    }

    fn drain(stream: &mut EventStream) -> Vec<SseFrame> {
        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = stream.try_recv() {
            decoder.extend(&chunk);
        }
        decoder.frames()
    }

    fn drain_events(rx: &mut broadcast::Receiver<ManagerEvent>) -> Vec<ManagerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_add_client_writes_preamble() {
        let manager = manager(ManagerConfig::for_testing());
        let (id, mut stream) = connect(&manager).await;

        assert_eq!(manager.client_count(), 1);
        assert_eq!(stream.head().status, 200);
        assert_eq!(
            stream.head().header("content-type"),
            Some("text/event-stream")
        );

        let frames = drain(&mut stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].comments, vec![String::new()]);
        assert_eq!(frames[1].data.as_deref(), Some(CONNECTED_PAYLOAD));
        assert!(manager.client_ids().contains(&id));
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let manager = manager(ManagerConfig::for_testing());
        let sent = manager
            .send_to_client(&ClientId::from("client-missing"), OutboundMessage::new("x"))
            .await;
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_targeted_message_carries_id_and_advances_watermark() {
        let manager = manager(ManagerConfig::for_testing());
        let (id, mut stream) = connect(&manager).await;
        drain(&mut stream);

        let message = OutboundMessage::new(serde_json::json!({ "n": 1 })).with_event("update");
        assert!(manager.send_to_client(&id, message).await);

        let frames = drain(&mut stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("update"));
        assert_eq!(frames[0].data.as_deref(), Some(r#"{"n":1}"#));

        let snapshot = manager.client_snapshot(&id).await.unwrap();
        let sent_id = frames[0].id.clone().unwrap();
        assert_eq!(
            snapshot.last_message_id.map(|m| m.to_string()),
            Some(sent_id)
        );
        assert_eq!(snapshot.queue_len, 0);
        assert_eq!(snapshot.metrics.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_backoff_queues_and_retry_sweep_delivers() {
        let manager = manager(ManagerConfig::for_testing());
        let (id, mut stream) = connect(&manager).await;
        drain(&mut stream);

        let cell = manager.inner.lookup(&id).unwrap();
        cell.lock().await.state.is_backoff = true;

        assert!(!manager.send_to_client(&id, OutboundMessage::new("first")).await);
        assert!(!manager.send_to_client(&id, OutboundMessage::new("second")).await);
        assert!(drain(&mut stream).is_empty());
        assert_eq!(manager.client_snapshot(&id).await.unwrap().queue_len, 2);

        manager.run_retry_sweep().await;
        assert!(drain(&mut stream).is_empty());

        cell.lock().await.state.is_backoff = false;
        manager.run_retry_sweep().await;

        let data: Vec<_> = drain(&mut stream)
            .into_iter()
            .filter_map(|f| f.data)
            .collect();
        assert_eq!(data, vec!["first", "second"]);
        assert_eq!(manager.client_snapshot(&id).await.unwrap().queue_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quality_change_emitted_once() {
        let manager = manager(ManagerConfig::for_testing());
        let (id, _stream) = connect(&manager).await;
        let mut events = manager.subscribe();

        // Fresh heartbeat, three errors, nothing sent: 0.4 + 0.2 = Fair
        {
            let cell = manager.inner.lookup(&id).unwrap();
            let mut client = cell.lock().await;
            client.state.metrics = crate::quality::ClientMetrics {
                error_count: 3,
                ..Default::default()
            };
        }

        manager.run_quality_sweep().await;
        manager.run_quality_sweep().await;

        let changes: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, ManagerEvent::ConnectionQualityChange { .. }))
            .collect();
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            changes[0],
            ManagerEvent::ConnectionQualityChange {
                old_quality: ConnectionQuality::Good,
                new_quality: ConnectionQuality::Fair,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poor_quality_enters_error_path() {
        let manager = manager(ManagerConfig::for_testing());
        let (id, mut stream) = connect(&manager).await;
        drain(&mut stream);
        let mut events = manager.subscribe();

        {
            let cell = manager.inner.lookup(&id).unwrap();
            cell.lock().await.state.metrics.error_count = 3;
        }
        tokio::time::advance(Duration::from_secs(46)).await;
        manager.run_quality_sweep().await;

        let names: Vec<_> = drain_events(&mut events).iter().map(ManagerEvent::name).collect();
        assert!(names.contains(&"connectionQualityChange"));
        assert!(names.contains(&"clientError"));
        // first failure reconnects immediately over the still-open stream
        assert!(names.contains(&"clientReconnected"));

        let frames = drain(&mut stream);
        assert_eq!(frames[0].event.as_deref(), Some(RECONNECT_EVENT));
        assert_eq!(frames[0].retry, Some(5000));

        let snapshot = manager.client_snapshot(&id).await.unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.metrics.error_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poor_transition_reported_once_while_backing_off() {
        let manager = manager(ManagerConfig::for_testing());
        let (id, _stream) = connect(&manager).await;
        let mut events = manager.subscribe();

        {
            let cell = manager.inner.lookup(&id).unwrap();
            let mut client = cell.lock().await;
            client.state.metrics.error_count = 3;
            client.state.is_backoff = true;
        }
        tokio::time::advance(Duration::from_secs(46)).await;
        manager.run_quality_sweep().await;
        manager.run_quality_sweep().await;

        let events = drain_events(&mut events);
        let changes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ManagerEvent::ConnectionQualityChange { .. }))
            .collect();
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            changes[0],
            ManagerEvent::ConnectionQualityChange {
                new_quality: ConnectionQuality::Poor,
                ..
            }
        ));
        // already backing off, so no new error path
        assert!(!events.iter().any(|e| matches!(e, ManagerEvent::ClientError { .. })));

        let snapshot = manager.client_snapshot(&id).await.unwrap();
        assert_eq!(snapshot.quality, ConnectionQuality::Poor);
        assert_eq!(snapshot.metrics.error_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_reasons() {
        let config = ManagerConfig {
            client_timeout: Duration::from_secs(10),
            ..ManagerConfig::for_testing()
        };
        let manager = manager(config);
        let (idle, _s1) = connect(&manager).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let (failed, _s2) = connect(&manager).await;
        let (gone, _s3) = connect(&manager).await;
        let (healthy, _s4) = connect(&manager).await;

        manager.inner.lookup(&failed).unwrap().lock().await.state.consecutive_failures = 5;
        manager.inner.lookup(&gone).unwrap().lock().await.connected = false;

        let mut events = manager.subscribe();
        manager.run_cleanup_sweep().await;

        let mut reasons: HashMap<ClientId, CleanupReason> = HashMap::new();
        for event in drain_events(&mut events) {
            if let ManagerEvent::ClientCleanup {
                client_id, reason, ..
            } = event
            {
                reasons.insert(client_id, reason);
            }
        }
        assert_eq!(reasons.len(), 3);
        assert_eq!(reasons[&idle], CleanupReason::Inactive);
        assert_eq!(reasons[&failed], CleanupReason::Failed);
        assert_eq!(reasons[&gone], CleanupReason::Disconnected);
        assert_eq!(manager.client_ids(), vec![healthy]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sweep_writes_comment() {
        let manager = manager(ManagerConfig::for_testing());
        let (id, mut stream) = connect(&manager).await;
        drain(&mut stream);

        tokio::time::advance(Duration::from_secs(20)).await;
        manager.run_heartbeat_sweep().await;

        let frames = drain(&mut stream);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].comments[0].starts_with("heartbeat "));
        let snapshot = manager.client_snapshot(&id).await.unwrap();
        assert_eq!(snapshot.idle_ms, 0);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_refuses() {
        let manager = manager(ManagerConfig::for_testing());
        let (_a, stream_a) = connect(&manager).await;
        let (_b, stream_b) = connect(&manager).await;

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(manager.is_shut_down());
        assert_eq!(manager.client_count(), 0);
        assert!(stream_a.state() != crate::transport::SinkState::Open);
        assert!(stream_b.state() != crate::transport::SinkState::Open);

        let (sink, _stream) = ChannelSink::pair(4);
        let result = manager
            .add_client(&ConnectionRequest::new(), Arc::new(sink))
            .await;
        assert!(matches!(result, Err(ManagerError::ShutDown)));
    }
}
