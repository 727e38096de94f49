//! Message Types
//!
//! What producers hand to the manager, and the ids it assigns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Monotonic message id
///
/// Ids are assigned when a message enters a client's queue and are never
/// reused, so per-client delivery order is id order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Allocate the next id
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery priority of a queued message
///
/// Only matters when a full queue has to evict something.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Survives eviction while lower priorities are queued
    High,
    /// Default priority
    #[default]
    Normal,
    /// Background traffic
    Low,
}

/// A targeted message on its way to one client
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    /// `event:` name, if any
    pub event: Option<String>,
    /// Payload; strings are sent raw, everything else as JSON
    pub data: Value,
    /// Eviction priority
    pub priority: MessagePriority,
    /// Retention override; defaults to the queue's retention period
    pub ttl: Option<Duration>,
}

impl OutboundMessage {
    /// Create a message carrying `data`
    #[must_use]
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            event: None,
            data: data.into(),
            priority: MessagePriority::Normal,
            ttl: None,
        }
    }

    /// Create a message from any serializable payload
    ///
    /// # Errors
    ///
    /// Returns the serialization error if `payload` cannot be represented as JSON.
    pub fn from_serialize<T: Serialize + ?Sized>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    /// Set the event name
    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a retention override
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Render a payload for the `data:` field
///
/// JSON strings go out as their raw text; any other value is serialized.
///
/// # Errors
///
/// Returns the serialization error from `serde_json`.
pub fn render_data(data: &Value) -> Result<String, serde_json::Error> {
    match data {
        Value::String(s) => Ok(s.clone()),
        other => serde_json::to_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_ids_increase() {
        let a = MessageId::next();
        let b = MessageId::next();
        assert!(b > a);
        assert_eq!(format!("{}", MessageId(9)), "9");
    }

    #[test]
    fn test_render_data() {
        assert_eq!(render_data(&json!("plain text")).unwrap(), "plain text");
        assert_eq!(
            render_data(&json!({"type": "test"})).unwrap(),
            r#"{"type":"test"}"#
        );
        assert_eq!(render_data(&json!(42)).unwrap(), "42");
    }

    #[test]
    fn test_builder() {
        let msg = OutboundMessage::new(json!({"n": 1}))
            .with_event("tick")
            .with_priority(MessagePriority::High)
            .with_ttl(Duration::from_secs(5));

        assert_eq!(msg.event.as_deref(), Some("tick"));
        assert_eq!(msg.priority, MessagePriority::High);
        assert_eq!(msg.ttl, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_priority_serde() {
        let p: MessagePriority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(p, MessagePriority::High);
        assert_eq!(MessagePriority::default(), MessagePriority::Normal);
    }
}
