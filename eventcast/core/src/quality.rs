//! Connection Quality Scoring
//!
//! Each client's delivery metrics are folded into a weighted score every
//! `connection_quality_interval`:
//!
//! | Factor          | Weight | 1.0            | 0.5             | 0.0     |
//! |-----------------|--------|----------------|-----------------|---------|
//! | heartbeat age   | 0.4    | < 30s          | 30s ..= 45s     | > 45s   |
//! | error count     | 0.3    | 0              | 1 ..= 2         | >= 3    |
//! | write latency   | 0.2    | < 100ms        | < 500ms         | >= 500ms|
//! | message success | 0.1    | `sent / (sent + errors)`, 1.0 with no traffic |
//!
//! A score of at least 0.8 is `Good`, at least 0.5 is `Fair`, anything lower is
//! `Poor`. A `Poor` client is pushed through the error path.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const HEARTBEAT_WEIGHT: f64 = 0.4;
const ERROR_WEIGHT: f64 = 0.3;
const LATENCY_WEIGHT: f64 = 0.2;
const SUCCESS_WEIGHT: f64 = 0.1;

const GOOD_THRESHOLD: f64 = 0.8;
const FAIR_THRESHOLD: f64 = 0.5;

/// Absorbs float noise in weighted sums that land exactly on a threshold
const SCORE_EPSILON: f64 = 1e-9;

const HEARTBEAT_FRESH: Duration = Duration::from_secs(30);
const HEARTBEAT_STALE: Duration = Duration::from_secs(45);

const LATENCY_FAST_MS: f64 = 100.0;
const LATENCY_SLOW_MS: f64 = 500.0;

/// Exponential moving average weight for latency samples
const LATENCY_ALPHA: f64 = 0.2;

/// Coarse connection quality
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Healthy
    #[default]
    Good,
    /// Degraded
    Fair,
    /// Unusable; triggers recovery
    Poor,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
        }
    }
}

/// Per-client delivery metrics
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClientMetrics {
    /// Inbound messages reported by the HTTP layer
    pub messages_received: u64,
    /// Frames written successfully
    pub messages_sent: u64,
    /// Inbound bytes reported by the HTTP layer
    pub bytes_received: u64,
    /// Bytes written successfully
    pub bytes_sent: u64,
    /// Duration of the most recent write (milliseconds)
    pub last_latency_ms: f64,
    /// Moving average of write duration (milliseconds)
    pub avg_latency_ms: f64,
    /// Errors seen by the error path
    pub error_count: u32,
    /// Writes folded into the latency average
    pub latency_samples: u64,
}

impl ClientMetrics {
    /// Record the duration of a successful write
    pub fn record_latency(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.latency_samples += 1;
        self.avg_latency_ms = if self.latency_samples == 1 {
            ms
        } else {
            LATENCY_ALPHA * ms + (1.0 - LATENCY_ALPHA) * self.avg_latency_ms
        };
        self.last_latency_ms = ms;
    }

    /// Fraction of delivery attempts that succeeded (1.0 with no traffic)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_ratio(&self) -> f64 {
        let total = self.messages_sent + u64::from(self.error_count);
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

/// The four quality factors, each in `0.0..=1.0`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityFactors {
    /// Heartbeat freshness
    pub heartbeat: f64,
    /// Error count
    pub error_rate: f64,
    /// Write latency
    pub latency: f64,
    /// Message success ratio
    pub message_success: f64,
}

impl QualityFactors {
    /// Score the metrics given the time since the last heartbeat
    ///
    /// A client that never heartbeat scores zero on that factor.
    #[must_use]
    pub fn from_metrics(metrics: &ClientMetrics, since_heartbeat: Option<Duration>) -> Self {
        let heartbeat = match since_heartbeat {
            Some(age) if age < HEARTBEAT_FRESH => 1.0,
            Some(age) if age <= HEARTBEAT_STALE => 0.5,
            _ => 0.0,
        };
        let error_rate = match metrics.error_count {
            0 => 1.0,
            1 | 2 => 0.5,
            _ => 0.0,
        };
        let latency = if metrics.avg_latency_ms < LATENCY_FAST_MS {
            1.0
        } else if metrics.avg_latency_ms < LATENCY_SLOW_MS {
            0.5
        } else {
            0.0
        };

        Self {
            heartbeat,
            error_rate,
            latency,
            message_success: metrics.success_ratio(),
        }
    }

    /// Weighted score in `0.0..=1.0`
    #[must_use]
    pub fn score(&self) -> f64 {
        self.heartbeat * HEARTBEAT_WEIGHT
            + self.error_rate * ERROR_WEIGHT
            + self.latency * LATENCY_WEIGHT
            + self.message_success * SUCCESS_WEIGHT
    }

    /// Map the score onto a quality bucket
    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        let score = self.score() + SCORE_EPSILON;
        if score >= GOOD_THRESHOLD {
            ConnectionQuality::Good
        } else if score >= FAIR_THRESHOLD {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }
}

/// Compute the quality bucket for a client
#[must_use]
pub fn calculate_quality(
    metrics: &ClientMetrics,
    since_heartbeat: Option<Duration>,
) -> ConnectionQuality {
    QualityFactors::from_metrics(metrics, since_heartbeat).quality()
}
