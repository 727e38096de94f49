//! Durable Message Queue
//!
//! Per-client bounded queue of targeted messages awaiting delivery. Messages
//! leave the queue when delivered, when their retention period lapses, or when
//! a full queue evicts them. Messages that exhaust their delivery attempts stay
//! put until one of those happens.
//!
//! # Eviction
//!
//! A full queue evicts its oldest non-`High` message. When every queued
//! message is `High`, a new `High` message evicts the oldest one and anything
//! else is rejected.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

use crate::compression::{CompressionStats, QueueCompressionStats};
use crate::message::{MessageId, MessagePriority, OutboundMessage};
use crate::reconnect::message_retry_delay;

/// A message held for delivery to one client
#[derive(Clone, Debug)]
pub struct QueuedMessage {
    /// Assigned id
    pub id: MessageId,
    /// `event:` name
    pub event: Option<String>,
    /// Payload
    pub data: Value,
    /// When the message was queued (wall clock)
    pub timestamp: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Eviction priority
    pub priority: MessagePriority,
    /// After this the message is purged
    pub expires_at: Instant,
    /// Earliest time of the next delivery attempt
    pub retry_after: Option<Instant>,
    /// Whether the last attempt sent a compressed payload
    pub compressed: bool,
    /// Stats of the last compressed attempt
    pub compression_stats: Option<CompressionStats>,
    exhaustion_logged: bool,
}

impl QueuedMessage {
    /// Build a queued message from an outbound one
    #[must_use]
    pub fn new(message: OutboundMessage, retention: Duration, now: Instant) -> Self {
        Self {
            id: MessageId::next(),
            event: message.event,
            data: message.data,
            timestamp: Utc::now(),
            attempts: 0,
            priority: message.priority,
            expires_at: now + message.ttl.unwrap_or(retention),
            retry_after: None,
            compressed: false,
            compression_stats: None,
            exhaustion_logged: false,
        }
    }

    /// Whether the retention period has lapsed
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Record a failed attempt and schedule the next one
    pub fn record_failure(&mut self, now: Instant, retry_cap: Duration) {
        self.attempts += 1;
        self.retry_after = Some(now + message_retry_delay(self.attempts, retry_cap));
    }

    /// Whether the message is due for another attempt
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.retry_after.map_or(true, |at| now >= at)
    }
}

/// Result of [`MessageQueue::push`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued with room to spare
    Queued(MessageId),
    /// Queued after evicting an older message
    QueuedWithEviction {
        /// The new message
        id: MessageId,
        /// The message that made room
        evicted: MessageId,
    },
    /// Not queued: full of `High` messages
    Rejected,
}

impl EnqueueOutcome {
    /// The id of the queued message, if it was queued
    #[must_use]
    pub fn id(self) -> Option<MessageId> {
        match self {
            Self::Queued(id) | Self::QueuedWithEviction { id, .. } => Some(id),
            Self::Rejected => None,
        }
    }
}

/// Bounded, id-ordered queue of undelivered messages
#[derive(Debug)]
pub struct MessageQueue {
    messages: VecDeque<QueuedMessage>,
    max_size: usize,
    max_attempts: u32,
    retention_period: Duration,
    /// Aggregate compression stats for this client
    pub compression_stats: QueueCompressionStats,
}

impl MessageQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(max_size: usize, max_attempts: u32, retention_period: Duration) -> Self {
        Self {
            messages: VecDeque::new(),
            max_size: max_size.max(1),
            max_attempts,
            retention_period,
            compression_stats: QueueCompressionStats::default(),
        }
    }

    /// Number of queued messages
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Capacity
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Attempts before a message counts as exhausted
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Default retention for new messages
    #[must_use]
    pub fn retention_period(&self) -> Duration {
        self.retention_period
    }

    /// Queue `message`, evicting if full
    pub fn push(&mut self, message: OutboundMessage, now: Instant) -> EnqueueOutcome {
        let incoming_high = message.priority == MessagePriority::High;

        let evicted = if self.messages.len() >= self.max_size {
            let victim = self
                .messages
                .iter()
                .position(|m| m.priority != MessagePriority::High)
                .or(if incoming_high { Some(0) } else { None });
            match victim.and_then(|idx| self.messages.remove(idx)) {
                Some(old) => Some(old.id),
                None => return EnqueueOutcome::Rejected,
            }
        } else {
            None
        };

        let queued = QueuedMessage::new(message, self.retention_period, now);
        let id = queued.id;
        self.messages.push_back(queued);

        match evicted {
            Some(evicted) => EnqueueOutcome::QueuedWithEviction { id, evicted },
            None => EnqueueOutcome::Queued(id),
        }
    }

    /// Look up a message
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&QueuedMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Look up a message mutably
    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut QueuedMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Whether `id` is still queued
    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a message (after delivery)
    pub fn remove(&mut self, id: MessageId) -> Option<QueuedMessage> {
        let idx = self.messages.iter().position(|m| m.id == id)?;
        self.messages.remove(idx)
    }

    /// Drop every message whose retention has lapsed; returns how many
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !m.is_expired(now));
        before - self.messages.len()
    }

    /// Iterate in id order
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }

    /// Messages the retry sweep should attempt now, in id order
    ///
    /// Exhausted messages are skipped. The walk stops at the first message
    /// still waiting out its retry delay so nothing overtakes it.
    #[must_use]
    pub fn retry_candidates(&self, watermark: Option<MessageId>, now: Instant) -> Vec<MessageId> {
        let mut ids = Vec::new();
        for msg in &self.messages {
            if watermark.is_some_and(|w| msg.id <= w) || msg.is_expired(now) {
                continue;
            }
            if msg.attempts >= self.max_attempts {
                continue;
            }
            if !msg.is_due(now) {
                break;
            }
            ids.push(msg.id);
        }
        ids
    }

    /// Messages to replay after a reconnection, in id order
    ///
    /// Everything above the watermark that has not expired, regardless of
    /// attempts or retry delay.
    #[must_use]
    pub fn replay_candidates(&self, watermark: Option<MessageId>, now: Instant) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| watermark.map_or(true, |w| m.id > w) && !m.is_expired(now))
            .map(|m| m.id)
            .collect()
    }

    /// Flag `id` as exhausted; returns `true` the first time only
    pub fn mark_exhaustion_logged(&mut self, id: MessageId) -> bool {
        let max_attempts = self.max_attempts;
        match self.get_mut(id) {
            Some(msg) if msg.attempts >= max_attempts && !msg.exhaustion_logged => {
                msg.exhaustion_logged = true;
                true
            }
            _ => false,
        }
    }
}
