//! Manager Events
//!
//! Diagnostic events emitted by the manager on a broadcast channel.
//! Subscribers that fall behind lose the oldest events; emitting never blocks.

use serde::Serialize;

use crate::client::ClientId;
use crate::message::MessageId;
use crate::quality::{ClientMetrics, ConnectionQuality};

/// Capacity of the manager's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why the cleanup sweep removed a client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupReason {
    /// No activity within the client timeout
    Inactive,
    /// Reconnection budget spent or quality poor
    Failed,
    /// Transport no longer connected
    Disconnected,
}

/// Events emitted by the manager
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ManagerEvent {
    /// A client registered
    ClientConnected {
        /// The new client
        client_id: ClientId,
    },

    /// A client was removed from the registry
    ClientDisconnected {
        /// The removed client
        client_id: ClientId,
    },

    /// A client's quality bucket changed
    ConnectionQualityChange {
        /// Affected client
        client_id: ClientId,
        /// Previous bucket
        old_quality: ConnectionQuality,
        /// New bucket
        new_quality: ConnectionQuality,
        /// Metrics the new bucket was computed from
        metrics: ClientMetrics,
    },

    /// A client went through the error path
    ClientError {
        /// Affected client
        client_id: ClientId,
        /// What went wrong
        error: String,
        /// Quality at the time of the error
        quality: ConnectionQuality,
        /// Failures since the last successful reconnect
        consecutive_failures: u32,
        /// Delivery watermark
        last_message_id: Option<MessageId>,
        /// Metrics at the time of the error
        metrics: ClientMetrics,
    },

    /// The cleanup sweep removed a client
    ClientCleanup {
        /// Removed client
        client_id: ClientId,
        /// Why
        reason: CleanupReason,
        /// Final metrics
        metrics: ClientMetrics,
    },

    /// A reconnection attempt succeeded
    ClientReconnected {
        /// Recovered client
        client_id: ClientId,
        /// Delivery watermark after replay
        last_message_id: Option<MessageId>,
    },
}

impl ManagerEvent {
    /// The client this event is about
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        match self {
            Self::ClientConnected { client_id }
            | Self::ClientDisconnected { client_id }
            | Self::ConnectionQualityChange { client_id, .. }
            | Self::ClientError { client_id, .. }
            | Self::ClientCleanup { client_id, .. }
            | Self::ClientReconnected { client_id, .. } => client_id,
        }
    }

    /// Stable event name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientConnected { .. } => "clientConnected",
            Self::ClientDisconnected { .. } => "clientDisconnected",
            Self::ConnectionQualityChange { .. } => "connectionQualityChange",
            Self::ClientError { .. } => "clientError",
            Self::ClientCleanup { .. } => "clientCleanup",
            Self::ClientReconnected { .. } => "clientReconnected",
        }
    }
}
