//! Reconnection Backoff
//!
//! Delay schedule for the error path and the retry schedule for queued
//! messages.
//!
//! ```text
//!   Active ──failure──▶ Backoff ──timer──▶ Reconnecting ──ok──▶ Active
//!     ▲                    ▲                    │
//!     │                    └──────failure───────┤
//!     └──failure 1 (immediate reconnect)        └──budget spent──▶ Terminated
//! ```

use std::time::Duration;

use serde::Serialize;

/// Delay before the second reconnection attempt
pub const BASE_BACKOFF: Duration = Duration::from_millis(1000);

/// Upper bound on any reconnection delay
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Delay before the first retry of a queued message
pub const BASE_MESSAGE_RETRY: Duration = Duration::from_secs(1);

/// Delay before reconnecting after `consecutive_failures` failures
///
/// The first failure reconnects immediately; after that the delay doubles
/// from [`BASE_BACKOFF`] up to [`MAX_BACKOFF`].
#[must_use]
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    if consecutive_failures <= 1 {
        return Duration::ZERO;
    }
    exponential(BASE_BACKOFF, consecutive_failures - 2, MAX_BACKOFF)
}

/// How long a queued message waits after its `attempts`-th failed delivery
#[must_use]
pub fn message_retry_delay(attempts: u32, cap: Duration) -> Duration {
    exponential(BASE_MESSAGE_RETRY, attempts.saturating_sub(1), cap)
}

fn exponential(base: Duration, exponent: u32, cap: Duration) -> Duration {
    // 2^31 overflows `Duration * u32`, and the cap is hit long before that.
    let factor = 1u32.checked_shl(exponent.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}

/// Where a client is in the reconnection state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPhase {
    /// Connected and delivering
    Active,
    /// Waiting for the backoff timer
    Backoff,
    /// A reconnection attempt is running
    Reconnecting,
    /// Not connected and no recovery scheduled; awaiting cleanup
    Disconnected,
}

impl ReconnectPhase {
    /// Derive the phase from client flags
    #[must_use]
    pub fn from_flags(connected: bool, is_backoff: bool, is_reconnecting: bool) -> Self {
        if is_reconnecting {
            Self::Reconnecting
        } else if is_backoff {
            Self::Backoff
        } else if connected {
            Self::Active
        } else {
            Self::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let delays: Vec<u64> = (1..=5)
            .map(|n| backoff_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 1000, 2000, 4000, 8000]);
    }

    #[test]
    fn test_backoff_cap() {
        assert_eq!(backoff_delay(6), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(7), MAX_BACKOFF);
        assert_eq!(backoff_delay(50), MAX_BACKOFF);
        assert_eq!(backoff_delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_zero_failures_is_immediate() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
    }

    #[test]
    fn test_message_retry_delay() {
        let cap = Duration::from_secs(10);
        assert_eq!(message_retry_delay(1, cap), Duration::from_secs(1));
        assert_eq!(message_retry_delay(2, cap), Duration::from_secs(2));
        assert_eq!(message_retry_delay(4, cap), Duration::from_secs(8));
        assert_eq!(message_retry_delay(5, cap), cap);
        assert_eq!(message_retry_delay(40, cap), cap);
    }

    #[test]
    fn test_phase_from_flags() {
        assert_eq!(ReconnectPhase::from_flags(true, false, false), ReconnectPhase::Active);
        assert_eq!(ReconnectPhase::from_flags(false, true, false), ReconnectPhase::Backoff);
        assert_eq!(
            ReconnectPhase::from_flags(false, true, true),
            ReconnectPhase::Reconnecting
        );
        assert_eq!(
            ReconnectPhase::from_flags(false, false, false),
            ReconnectPhase::Disconnected
        );
    }
}
