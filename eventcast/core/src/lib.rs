//! Eventcast Core - Server-Sent Events Connection Manager
//!
//! This crate keeps long-lived event-stream connections healthy: it registers
//! clients, delivers broadcast and targeted messages, queues what could not be
//! delivered, and walks failing clients through backoff and reconnection. It
//! knows nothing about HTTP; any server that can hand it an [`EventSink`] can
//! use it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      HTTP layer (axum, ...)                       │
//! │   GET /events ──► ChannelSink ◄──────► EventStream ──► body       │
//! └──────────────────────────────┬───────────────────────────────────┘
//!                                │ add_client / send_to_client / broadcast
//! ┌──────────────────────────────┼───────────────────────────────────┐
//! │                         SseManager                                │
//! │  ┌───────────────┐  ┌────────────────┐  ┌──────────────────────┐ │
//! │  │   Registry    │  │ Per-client     │  │  Sweeps              │ │
//! │  │ ClientId ──►  │  │ MessageQueue   │  │  cleanup · retry     │ │
//! │  │ Mutex<Client> │  │ history, state │  │  quality · heartbeat │ │
//! │  └───────────────┘  └────────────────┘  └──────────────────────┘ │
//! │                              │                                    │
//! │                    ManagerEvent (broadcast channel)               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use eventcast_core::{ChannelSink, ConnectionRequest, ManagerConfig, OutboundMessage, SseManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = SseManager::new(ManagerConfig::from_env());
//!
//!     let (sink, mut stream) = ChannelSink::pair(256);
//!     let id = manager
//!         .add_client(&ConnectionRequest::new(), Arc::new(sink))
//!         .await
//!         .unwrap();
//!
//!     manager.send_to_client(&id, OutboundMessage::new("hello")).await;
//!     while let Some(frame) = stream.recv().await {
//!         // write `frame` to the response body
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`manager`]: registry, delivery and the reconnection state machine
//! - [`client`]: per-client state and diagnostic snapshots
//! - [`queue`]: bounded per-client queue of undelivered messages
//! - [`message`]: outbound messages and their ids
//! - [`quality`]: connection quality scoring
//! - [`reconnect`]: backoff schedules and reconnection phases
//! - [`compression`]: payload compression and its statistics
//! - [`events`]: events emitted to subscribers
//! - [`config`]: configuration from defaults, TOML and environment
//! - [`transport`]: the sink abstraction and event-stream framing
//! - [`global`]: process-wide manager instance

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod compression;
pub mod config;
pub mod error;
pub mod events;
pub mod global;
pub mod manager;
pub mod message;
pub mod quality;
pub mod queue;
pub mod reconnect;
mod sweeps;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientFeatures, ClientId, ClientSnapshot, ClientState, HistoryEntry};
pub use compression::{CompressionAlgorithm, CompressionError, CompressionStats, QueueCompressionStats};
pub use error::{ClientFailure, ManagerError, WriteError};
pub use events::{CleanupReason, ManagerEvent};
pub use global::{get_sse_manager, reset_sse_manager};
pub use manager::{BroadcastResult, SseManager, CONNECTED_PAYLOAD, RECONNECT_EVENT};
pub use message::{MessageId, MessagePriority, OutboundMessage};
pub use quality::{ClientMetrics, ConnectionQuality};
pub use queue::{EnqueueOutcome, MessageQueue, QueuedMessage};
pub use reconnect::ReconnectPhase;
pub use sweeps::SweepKind;
pub use transport::{
    ChannelSink, ConnectionRequest, EventSink, EventStream, FrameDecoder, ResponseHead, SinkState,
    SseFrame, TransportError,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, EventcastToml, LogLevel,
    ManagerConfig,
};
