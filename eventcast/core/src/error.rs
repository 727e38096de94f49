//! Error Types
//!
//! Errors inside the manager never cross the public API as panics or
//! propagated failures; they become state transitions, log lines, and
//! [`ManagerEvent`](crate::ManagerEvent)s. Only registration can fail
//! outright.

use thiserror::Error;

use crate::compression::CompressionError;
use crate::transport::TransportError;

/// Why a single write to a client failed
#[derive(Debug, Error)]
pub enum WriteError {
    /// The payload could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The payload could not be compressed
    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// The transport rejected the frame
    #[error("Transport write failed: {0}")]
    Transport(#[from] TransportError),
}

/// Why a client entered the error path
#[derive(Debug, Error)]
pub enum ClientFailure {
    /// A write failed
    #[error(transparent)]
    Write(#[from] WriteError),

    /// The quality sweep scored the connection poor
    #[error("Connection quality degraded to poor")]
    PoorQuality,

    /// Restoring the connection did not succeed
    #[error("Reconnection attempt failed")]
    ReconnectFailed,
}

/// Errors returned by [`SseManager::add_client`](crate::SseManager::add_client)
#[derive(Debug, Error)]
pub enum ManagerError {
    /// `max_concurrent_clients` are already registered
    #[error("Client limit reached ({limit} concurrent clients)")]
    CapacityExceeded {
        /// The configured limit
        limit: usize,
    },

    /// The manager has been shut down
    #[error("Manager is shut down")]
    ShutDown,
}
