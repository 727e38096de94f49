//! Client State
//!
//! Everything the manager tracks per connected client. A [`Client`] is only
//! ever touched while its cell's mutex is held, so plain fields suffice.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::compression::{CompressionStats, QueueCompressionStats};
use crate::config::ManagerConfig;
use crate::message::MessageId;
use crate::quality::{ClientMetrics, ConnectionQuality};
use crate::queue::MessageQueue;
use crate::reconnect::ReconnectPhase;
use crate::transport::{ConnectionRequest, EventSink};

/// Request headers copied into client metadata
const METADATA_HEADERS: &[&str] = &["user-agent", "origin", "last-event-id", "x-forwarded-for"];

/// Unique identifier for a connected client
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a new unique client ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("client-{}", Uuid::new_v4()))
    }

    /// Borrow as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Capabilities fixed at registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ClientFeatures {
    /// Honors the `retry:` field
    pub supports_retry: bool,
    /// Resumes with `Last-Event-ID`
    pub supports_last_event_id: bool,
    /// Accepts binary frames
    pub supports_binary: bool,
    /// Accepts compressed payloads
    pub supports_compression: bool,
}

impl ClientFeatures {
    /// Defaults for a standard event-stream client
    #[must_use]
    pub fn standard(compression: bool) -> Self {
        Self {
            supports_retry: true,
            supports_last_event_id: true,
            supports_binary: false,
            supports_compression: compression,
        }
    }
}

/// Reconnection and health state of a client
#[derive(Clone, Debug)]
pub struct ClientState {
    /// A reconnection attempt is running
    pub is_reconnecting: bool,
    /// Start of the most recent reconnection attempt
    pub last_reconnect_attempt: Option<Instant>,
    /// Failures since the last successful reconnect
    pub consecutive_failures: u32,
    /// Highest delivered message id
    pub last_message_id: Option<MessageId>,
    /// Waiting for a scheduled reconnect
    pub is_backoff: bool,
    /// When the scheduled reconnect fires
    pub backoff_until: Option<Instant>,
    /// Last successful heartbeat (written or acknowledged)
    pub last_heartbeat: Option<Instant>,
    /// Current quality bucket
    pub connection_quality: ConnectionQuality,
    /// Extra response headers re-issued on reconnection
    pub custom_headers: HashMap<String, String>,
    /// Capabilities
    pub features: ClientFeatures,
    /// Delivery metrics
    pub metrics: ClientMetrics,
}

impl ClientState {
    fn new(features: ClientFeatures, now: Instant) -> Self {
        Self {
            is_reconnecting: false,
            last_reconnect_attempt: None,
            consecutive_failures: 0,
            last_message_id: None,
            is_backoff: false,
            backoff_until: None,
            last_heartbeat: Some(now),
            connection_quality: ConnectionQuality::Good,
            custom_headers: HashMap::new(),
            features,
            metrics: ClientMetrics::default(),
        }
    }
}

/// One delivered frame, kept for diagnostics
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// When it was written
    pub timestamp: DateTime<Utc>,
    /// Queue id, for targeted messages
    pub id: Option<MessageId>,
    /// `event:` name
    pub event: Option<String>,
    /// Rendered payload as written (base64 when compressed)
    pub data: String,
    /// Whether the payload was compressed
    pub compressed: bool,
}

/// A registered client
#[derive(Debug)]
pub struct Client {
    /// Identifier
    pub id: ClientId,
    /// Transport handle
    pub sink: Arc<dyn EventSink>,
    /// Whether the stream is usable
    pub connected: bool,
    /// Registration time
    pub connected_at: DateTime<Utc>,
    /// Last successful write or reported inbound activity
    pub last_activity: Instant,
    /// Recently delivered frames, oldest first
    pub history: VecDeque<HistoryEntry>,
    /// Bound on `history`
    pub history_limit: usize,
    /// Reconnection attempts since the last success
    pub reconnect_attempts: u32,
    /// Failure budget
    pub max_reconnect_attempts: u32,
    /// Advertised reconnection delay
    pub reconnect_delay: Duration,
    /// Reconnection and health state
    pub state: ClientState,
    /// Undelivered targeted messages
    pub message_queue: MessageQueue,
    /// Selected request headers
    pub metadata: HashMap<String, String>,
}

impl Client {
    /// Create a client in its initial state
    #[must_use]
    pub fn new(
        id: ClientId,
        sink: Arc<dyn EventSink>,
        request: &ConnectionRequest,
        config: &ManagerConfig,
    ) -> Self {
        let now = Instant::now();
        let metadata = METADATA_HEADERS
            .iter()
            .filter_map(|name| request.header(name).map(|v| ((*name).to_string(), v.to_string())))
            .chain(
                request
                    .peer_addr()
                    .map(|addr| ("peer_addr".to_string(), addr.to_string())),
            )
            .collect();

        Self {
            id,
            sink,
            connected: true,
            connected_at: Utc::now(),
            last_activity: now,
            history: VecDeque::new(),
            history_limit: config.message_history,
            reconnect_attempts: 0,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
            state: ClientState::new(ClientFeatures::standard(config.enable_compression), now),
            message_queue: MessageQueue::new(
                config.message_queue_size,
                config.message_retry_attempts,
                config.message_retention_period,
            ),
            metadata,
        }
    }

    /// Current reconnection phase
    #[must_use]
    pub fn phase(&self) -> ReconnectPhase {
        ReconnectPhase::from_flags(
            self.connected,
            self.state.is_backoff,
            self.state.is_reconnecting,
        )
    }

    /// Advance the delivery watermark; never moves backwards
    pub fn advance_watermark(&mut self, id: MessageId) {
        if self.state.last_message_id.map_or(true, |w| id > w) {
            self.state.last_message_id = Some(id);
        }
    }

    /// Book-keeping after a successful write
    pub fn record_delivery(&mut self, bytes: usize, latency: Duration, entry: HistoryEntry) {
        let metrics = &mut self.state.metrics;
        metrics.messages_sent += 1;
        metrics.bytes_sent += bytes as u64;
        metrics.record_latency(latency);
        self.last_activity = Instant::now();

        if self.history_limit > 0 {
            while self.history.len() >= self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(entry);
        }
    }

    /// Book-keeping after a successful heartbeat write
    pub fn record_heartbeat(&mut self, bytes: usize) {
        let now = Instant::now();
        self.state.metrics.bytes_sent += bytes as u64;
        self.state.last_heartbeat = Some(now);
        self.last_activity = now;
    }

    /// Book-keeping for inbound traffic reported by the HTTP layer
    pub fn record_inbound(&mut self, bytes: usize) {
        let now = Instant::now();
        self.state.metrics.messages_received += 1;
        self.state.metrics.bytes_received += bytes as u64;
        self.state.last_heartbeat = Some(now);
        self.last_activity = now;
    }

    /// Read-only view for diagnostics
    #[must_use]
    pub fn snapshot(&self) -> ClientSnapshot {
        let now = Instant::now();
        ClientSnapshot {
            id: self.id.clone(),
            connected: self.connected,
            connected_at: self.connected_at,
            phase: self.phase(),
            quality: self.state.connection_quality,
            consecutive_failures: self.state.consecutive_failures,
            reconnect_attempts: self.reconnect_attempts,
            last_message_id: self.state.last_message_id,
            backoff_remaining_ms: self
                .state
                .backoff_until
                .map(|until| duration_ms(until.saturating_duration_since(now))),
            idle_ms: duration_ms(now.saturating_duration_since(self.last_activity)),
            queue_len: self.message_queue.current_size(),
            queue_max: self.message_queue.max_size(),
            queued_ids: self.message_queue.iter().map(|m| m.id).collect(),
            features: self.state.features,
            metrics: self.state.metrics.clone(),
            compression_stats: self.message_queue.compression_stats.clone(),
            history: self.history.iter().cloned().collect(),
            metadata: self.metadata.clone(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Serializable view of a client
#[derive(Clone, Debug, Serialize)]
pub struct ClientSnapshot {
    /// Identifier
    pub id: ClientId,
    /// Whether the stream is usable
    pub connected: bool,
    /// Registration time
    pub connected_at: DateTime<Utc>,
    /// Reconnection phase
    pub phase: ReconnectPhase,
    /// Quality bucket
    pub quality: ConnectionQuality,
    /// Failures since the last successful reconnect
    pub consecutive_failures: u32,
    /// Reconnection attempts since the last success
    pub reconnect_attempts: u32,
    /// Delivery watermark
    pub last_message_id: Option<MessageId>,
    /// Time until the scheduled reconnect
    pub backoff_remaining_ms: Option<u64>,
    /// Time since the last activity
    pub idle_ms: u64,
    /// Queued messages
    pub queue_len: usize,
    /// Queue capacity
    pub queue_max: usize,
    /// Ids still queued, in order
    pub queued_ids: Vec<MessageId>,
    /// Capabilities
    pub features: ClientFeatures,
    /// Delivery metrics
    pub metrics: ClientMetrics,
    /// Aggregate compression stats
    pub compression_stats: QueueCompressionStats,
    /// Recently delivered frames
    pub history: Vec<HistoryEntry>,
    /// Selected request headers
    pub metadata: HashMap<String, String>,
}

impl ClientSnapshot {
    /// The most recent history entry
    #[must_use]
    pub fn last_delivered(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }
}

/// Build the history entry for a delivered frame
pub(crate) fn history_entry(
    id: Option<MessageId>,
    event: Option<&str>,
    data: &str,
    compression: Option<&CompressionStats>,
) -> HistoryEntry {
    HistoryEntry {
        timestamp: Utc::now(),
        id,
        event: event.map(str::to_string),
        data: data.to_string(),
        compressed: compression.is_some(),
    }
}
