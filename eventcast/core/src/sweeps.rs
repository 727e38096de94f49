//! Periodic Sweeps
//!
//! Four background tasks run for the life of a manager:
//!
//! - **cleanup** removes inactive, failed and disconnected clients
//! - **retry** re-attempts queued messages whose retry delay has passed
//! - **quality** rescores each client and escalates poor connections
//! - **heartbeat** keeps idle streams alive through proxies
//!
//! Each task holds only a weak reference to the manager and exits once the
//! manager is dropped. [`SweepHandles::abort_all`] stops them at shutdown.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::manager::ManagerInner;

/// Shortest allowed sweep period
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// The periodic maintenance tasks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SweepKind {
    /// Remove dead clients
    Cleanup,
    /// Re-attempt queued messages
    Retry,
    /// Rescore connection quality
    Quality,
    /// Write keep-alive comments
    Heartbeat,
}

impl SweepKind {
    /// All sweeps, in spawn order
    pub const ALL: [SweepKind; 4] = [
        SweepKind::Cleanup,
        SweepKind::Retry,
        SweepKind::Quality,
        SweepKind::Heartbeat,
    ];

    /// Name used in logs
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SweepKind::Cleanup => "cleanup",
            SweepKind::Retry => "retry",
            SweepKind::Quality => "quality",
            SweepKind::Heartbeat => "heartbeat",
        }
    }
}

/// Join handles of the running sweeps
#[derive(Debug)]
pub(crate) struct SweepHandles {
    tasks: Vec<(SweepKind, JoinHandle<()>)>,
}

impl SweepHandles {
    /// Abort every sweep
    pub(crate) fn abort_all(self) {
        for (kind, handle) in self.tasks {
            handle.abort();
            debug!(sweep = kind.name(), "Sweep stopped");
        }
    }
}

/// Start all sweeps with the periods from the manager's config
pub(crate) fn spawn_sweeps(manager: &Arc<ManagerInner>) -> SweepHandles {
    let config = manager.config();
    let tasks = SweepKind::ALL
        .into_iter()
        .map(|kind| {
            let period = match kind {
                SweepKind::Cleanup => config.cleanup_interval,
                SweepKind::Retry => config.message_retry_interval,
                SweepKind::Quality => config.connection_quality_interval,
                SweepKind::Heartbeat => config.heartbeat_interval,
            };
            (kind, spawn_sweep(kind, period, Arc::downgrade(manager)))
        })
        .collect();

    SweepHandles { tasks }
}

fn spawn_sweep(kind: SweepKind, period: Duration, manager: Weak<ManagerInner>) -> JoinHandle<()> {
    let period = period.max(MIN_PERIOD);
    debug!(
        sweep = kind.name(),
        period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        "Starting sweep"
    );

    tokio::spawn(async move {
        // First tick one period from now, not immediately.
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            trace!(sweep = kind.name(), "Sweep tick");
            manager.run_sweep(kind).await;
        }
        debug!(sweep = kind.name(), "Manager dropped, sweep exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::transport::{ChannelSink, ConnectionRequest, FrameDecoder};
    use crate::SseManager;

    #[test]
    fn test_sweep_names() {
        let names: Vec<_> = SweepKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, vec!["cleanup", "retry", "quality", "heartbeat"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sweep_fires_on_interval() {
        let config = ManagerConfig {
            heartbeat_interval: Duration::from_secs(30),
            ..ManagerConfig::for_testing()
        };
        let manager = SseManager::new(config);
        let (sink, mut stream) = ChannelSink::pair(16);
        manager
            .add_client(&ConnectionRequest::new(), Arc::new(sink))
            .await
            .unwrap();
        while stream.try_recv().is_some() {}

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(stream.try_recv().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = stream.try_recv() {
            decoder.extend(&chunk);
        }
        let frames = decoder.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].comments[0].starts_with("heartbeat"));
    }
}
