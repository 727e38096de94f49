//! Payload Compression
//!
//! Optional per-message compression of event payloads. A compressed payload
//! is only used when it is strictly smaller than the original; the frame then
//! carries the base64 of the compressed bytes.
//!
//! | Algorithm | Encoder                     |
//! |-----------|-----------------------------|
//! | `gzip`    | `flate2::write::GzEncoder`   |
//! | `deflate` | `flate2::write::ZlibEncoder` |
//! | `brotli`  | `brotli::CompressorWriter`   |

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::time::{Duration, Instant};

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payloads larger than this are compressed with gzip when auto-selecting
pub const LARGE_PAYLOAD_THRESHOLD: usize = 64 * 1024;

/// Share of printable ASCII above which a payload counts as text
const TEXT_RATIO_THRESHOLD: f64 = 0.9;

/// Brotli quality; favours speed on the hot write path
const BROTLI_QUALITY: u32 = 5;

/// Brotli window size (log2)
const BROTLI_LGWIN: u32 = 22;

const BROTLI_BUFFER_SIZE: usize = 4096;

/// Supported compression algorithms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// gzip container around deflate
    #[default]
    Gzip,
    /// zlib-wrapped deflate
    Deflate,
    /// Brotli
    Brotli,
}

impl CompressionAlgorithm {
    /// Lower-case name used on the wire and in stats
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "brotli",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            "brotli" | "br" => Ok(Self::Brotli),
            other => Err(CompressionError::Unsupported(other.to_string())),
        }
    }
}

/// Errors from compressing a payload
#[derive(Debug, Error)]
pub enum CompressionError {
    /// The encoder failed
    #[error("Compression failed: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown algorithm name
    #[error("Unsupported compression algorithm: {0}")]
    Unsupported(String),
}

/// Outcome of compressing one message
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompressionStats {
    /// Algorithm used
    pub algorithm: CompressionAlgorithm,
    /// Payload size before compression (bytes)
    pub original_size: usize,
    /// Payload size after compression (bytes)
    pub compressed_size: usize,
    /// `original_size / compressed_size`, above 1.0 when compression paid off
    pub compression_ratio: f64,
    /// Time spent compressing
    pub compression_time: Duration,
}

impl CompressionStats {
    /// Bytes saved by compressing
    #[must_use]
    pub fn bytes_saved(&self) -> usize {
        self.original_size.saturating_sub(self.compressed_size)
    }
}

/// Running totals for one algorithm
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AlgorithmStats {
    /// Messages compressed with this algorithm
    pub count: u64,
    /// Bytes saved with this algorithm
    pub total_saved: u64,
    /// Mean per-message compression ratio
    pub avg_ratio: f64,
}

/// Aggregate compression statistics for one client's queue
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueCompressionStats {
    /// Compressed bytes written
    pub total_compressed: u64,
    /// Original bytes of the payloads that were compressed
    pub total_uncompressed: u64,
    /// `total_uncompressed / total_compressed` (1.0 until something is compressed)
    pub avg_compression_ratio: f64,
    /// `total_uncompressed - total_compressed`
    pub bytes_saved: u64,
    /// Time spent compressing
    pub compression_time_total: Duration,
    /// Mean time per compressed message
    pub compression_time_avg: Duration,
    /// Number of compressed messages
    pub messages_compressed: u64,
    /// Per-algorithm breakdown, keyed by algorithm name
    pub by_algorithm: HashMap<String, AlgorithmStats>,
}

impl Default for QueueCompressionStats {
    fn default() -> Self {
        Self {
            total_compressed: 0,
            total_uncompressed: 0,
            avg_compression_ratio: 1.0,
            bytes_saved: 0,
            compression_time_total: Duration::ZERO,
            compression_time_avg: Duration::ZERO,
            messages_compressed: 0,
            by_algorithm: HashMap::new(),
        }
    }
}

impl QueueCompressionStats {
    /// Fold one message's stats into the aggregate
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&mut self, stats: &CompressionStats) {
        self.messages_compressed += 1;
        self.total_compressed += stats.compressed_size as u64;
        self.total_uncompressed += stats.original_size as u64;
        self.bytes_saved = self.total_uncompressed.saturating_sub(self.total_compressed);
        if self.total_compressed > 0 {
            self.avg_compression_ratio =
                self.total_uncompressed as f64 / self.total_compressed as f64;
        }
        self.compression_time_total += stats.compression_time;
        self.compression_time_avg = self.compression_time_total
            / u32::try_from(self.messages_compressed).unwrap_or(u32::MAX);

        let entry = self
            .by_algorithm
            .entry(stats.algorithm.as_str().to_string())
            .or_default();
        entry.count += 1;
        entry.total_saved += stats.bytes_saved() as u64;
        entry.avg_ratio += (stats.compression_ratio - entry.avg_ratio) / entry.count as f64;
    }
}

/// A payload that compressed to something smaller
#[derive(Clone, Debug)]
pub struct Compressed {
    /// Compressed bytes
    pub bytes: Vec<u8>,
    /// How it went
    pub stats: CompressionStats,
}

/// Compress `input` with `algorithm`
///
/// # Errors
///
/// Returns `CompressionError::Io` if the encoder fails.
pub fn compress(algorithm: CompressionAlgorithm, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match algorithm {
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(input)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgorithm::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(input)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgorithm::Brotli => {
            let mut writer = brotli::CompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LGWIN,
            );
            writer.write_all(input)?;
            writer.flush()?;
            Ok(writer.into_inner())
        }
    }
}

/// Compress `input`, keeping the result only if it is strictly smaller
///
/// # Errors
///
/// Returns `CompressionError::Io` if the encoder fails.
#[allow(clippy::cast_precision_loss)]
pub fn compress_if_smaller(
    algorithm: CompressionAlgorithm,
    input: &[u8],
) -> Result<Option<Compressed>, CompressionError> {
    let started = Instant::now();
    let bytes = compress(algorithm, input)?;
    let compression_time = started.elapsed();

    if bytes.len() >= input.len() {
        tracing::trace!(
            algorithm = %algorithm,
            original_size = input.len(),
            compressed_size = bytes.len(),
            "Compressed payload not smaller, sending uncompressed"
        );
        return Ok(None);
    }

    let stats = CompressionStats {
        algorithm,
        original_size: input.len(),
        compressed_size: bytes.len(),
        compression_ratio: input.len() as f64 / bytes.len() as f64,
        compression_time,
    };
    Ok(Some(Compressed { bytes, stats }))
}

/// Pick an algorithm from the payload's size and content
///
/// Large payloads get gzip for speed, text-like payloads get brotli for
/// ratio, everything else gets deflate.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn select_algorithm(payload: &[u8]) -> CompressionAlgorithm {
    if payload.len() > LARGE_PAYLOAD_THRESHOLD {
        return CompressionAlgorithm::Gzip;
    }
    if payload.is_empty() {
        return CompressionAlgorithm::Deflate;
    }
    let printable = payload
        .iter()
        .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
        .count();
    if printable as f64 / payload.len() as f64 >= TEXT_RATIO_THRESHOLD {
        CompressionAlgorithm::Brotli
    } else {
        CompressionAlgorithm::Deflate
    }
}
