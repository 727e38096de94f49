//! Manager Configuration
//!
//! [`ManagerConfig`] holds every tunable of the connection manager. Values are
//! layered with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon after loading)
//! 2. Environment variables (`EVENTCAST_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! The file lives at `$XDG_CONFIG_HOME/eventcast/eventcast.toml`
//! (typically `~/.config/eventcast/eventcast.toml`).
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! max_concurrent_clients = 1000
//! log_level = "info"
//! heartbeat_interval_ms = 30000
//! client_timeout_ms = 60000
//! cleanup_interval_ms = 300000
//! connection_quality_interval_ms = 60000
//!
//! [clients]
//! message_history = 50
//! max_reconnect_attempts = 5
//! reconnect_delay_ms = 5000
//!
//! [queue]
//! size = 1000
//! retry_attempts = 3
//! retry_interval_ms = 10000
//! retention_period_ms = 3600000
//!
//! [compression]
//! enabled = false
//! min_size = 1024
//! algorithm = "gzip"
//! auto_select = false
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::CompressionAlgorithm;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Log Level
// =============================================================================

/// Verbosity of the manager's own logging
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-frame detail and sweep status lines
    Debug,
    /// Lifecycle events
    #[default]
    Info,
    /// Degradation only
    Warn,
    /// Failures only
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(ConfigError::ValidationError(format!(
                "unknown log level '{other}'"
            ))),
        }
    }
}

// =============================================================================
// Manager Configuration
// =============================================================================

/// Configuration for [`SseManager`](crate::SseManager)
#[derive(Clone, Debug, PartialEq)]
pub struct ManagerConfig {
    /// Interval between heartbeat comments (default: 30 seconds)
    pub heartbeat_interval: Duration,
    /// Inactivity after which the cleanup sweep evicts a client (default: 60 seconds)
    pub client_timeout: Duration,
    /// Delivered frames kept per client (default: 50)
    pub message_history: usize,
    /// Consecutive failures before a client is terminated (default: 5)
    pub max_reconnect_attempts: u32,
    /// Reconnection delay advertised to clients via `retry:` (default: 5 seconds)
    pub reconnect_delay: Duration,
    /// Interval of the cleanup sweep (default: 5 minutes)
    pub cleanup_interval: Duration,
    /// Maximum queued messages per client (default: 1000)
    pub message_queue_size: usize,
    /// Delivery attempts per queued message (default: 3)
    pub message_retry_attempts: u32,
    /// Interval of the retry sweep, and cap on per-message retry delay (default: 10 seconds)
    pub message_retry_interval: Duration,
    /// How long a queued message stays eligible (default: 1 hour)
    pub message_retention_period: Duration,
    /// Interval of the quality sweep (default: 60 seconds)
    pub connection_quality_interval: Duration,
    /// Whether payload compression is enabled (default: false)
    pub enable_compression: bool,
    /// Maximum registered clients (default: 1000)
    pub max_concurrent_clients: usize,
    /// Logging verbosity (default: info)
    pub log_level: LogLevel,
    /// Payloads must be longer than this to be compressed (default: 1024 bytes)
    pub compression_min_size: usize,
    /// Algorithm used when not auto-selecting (default: gzip)
    pub compression_algorithm: CompressionAlgorithm,
    /// Pick the algorithm per payload (default: false)
    pub auto_select_compression: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            message_history: 50,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(300),
            message_queue_size: 1000,
            message_retry_attempts: 3,
            message_retry_interval: Duration::from_secs(10),
            message_retention_period: Duration::from_secs(3600),
            connection_quality_interval: Duration::from_secs(60),
            enable_compression: false,
            max_concurrent_clients: 1000,
            log_level: LogLevel::Info,
            compression_min_size: 1024,
            compression_algorithm: CompressionAlgorithm::Gzip,
            auto_select_compression: false,
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `EVENTCAST_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env_config(&mut config);
        config
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the inactivity timeout
    #[must_use]
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Set the cleanup sweep interval
    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the per-client queue bound
    #[must_use]
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.message_queue_size = size;
        self
    }

    /// Set the reconnection budget
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Enable compression of payloads longer than `min_size`
    #[must_use]
    pub fn with_compression(mut self, algorithm: CompressionAlgorithm, min_size: usize) -> Self {
        self.enable_compression = true;
        self.compression_algorithm = algorithm;
        self.compression_min_size = min_size;
        self
    }

    /// Set the client cap
    #[must_use]
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_concurrent_clients = max;
        self
    }

    /// A config suitable for testing
    ///
    /// Sweeps are pushed far into the future so tests drive them manually.
    #[must_use]
    pub fn for_testing() -> Self {
        let far = Duration::from_secs(24 * 3600);
        Self {
            heartbeat_interval: far,
            cleanup_interval: far,
            message_retry_interval: far,
            connection_quality_interval: far,
            client_timeout: far,
            ..Self::default()
        }
    }

    /// Check that the values can drive a manager
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("client_timeout", self.client_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("message_retry_interval", self.message_retry_interval),
            ("message_retention_period", self.message_retention_period),
            ("connection_quality_interval", self.connection_quality_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.message_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "message_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.message_retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "message_retry_attempts must be greater than zero".to_string(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_reconnect_attempts must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_clients == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_clients must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Maximum registered clients
    pub max_concurrent_clients: Option<usize>,
    /// Logging verbosity
    pub log_level: Option<LogLevel>,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: Option<u64>,
    /// Inactivity timeout in milliseconds
    pub client_timeout_ms: Option<u64>,
    /// Cleanup sweep interval in milliseconds
    pub cleanup_interval_ms: Option<u64>,
    /// Quality sweep interval in milliseconds
    pub connection_quality_interval_ms: Option<u64>,
}

/// Clients section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsToml {
    /// Delivered frames kept per client
    pub message_history: Option<usize>,
    /// Consecutive failures before termination
    pub max_reconnect_attempts: Option<u32>,
    /// Advertised reconnection delay in milliseconds
    pub reconnect_delay_ms: Option<u64>,
}

/// Queue section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueToml {
    /// Maximum queued messages per client
    pub size: Option<usize>,
    /// Delivery attempts per message
    pub retry_attempts: Option<u32>,
    /// Retry sweep interval in milliseconds
    pub retry_interval_ms: Option<u64>,
    /// Retention period in milliseconds
    pub retention_period_ms: Option<u64>,
}

/// Compression section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionToml {
    /// Whether compression is enabled
    pub enabled: Option<bool>,
    /// Minimum payload size in bytes
    pub min_size: Option<usize>,
    /// Fixed algorithm
    pub algorithm: Option<CompressionAlgorithm>,
    /// Pick the algorithm per payload
    pub auto_select: Option<bool>,
}

/// Root of the TOML configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventcastToml {
    /// `[server]`
    pub server: ServerToml,
    /// `[clients]`
    pub clients: ClientsToml,
    /// `[queue]`
    pub queue: QueueToml,
    /// `[compression]`
    pub compression: CompressionToml,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/eventcast/eventcast.toml` or
/// `~/.config/eventcast/eventcast.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("eventcast").join("eventcast.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// merged values fail validation. A missing file is not an error.
pub fn load_config() -> Result<ManagerConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the merged
/// values fail validation.
pub fn load_config_from_path(path: Option<&Path>) -> Result<ManagerConfig, ConfigError> {
    let mut config = ManagerConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: EventcastToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML values over `config`
pub fn apply_toml_config(config: &mut ManagerConfig, toml: &EventcastToml) {
    let ms = Duration::from_millis;

    if let Some(max) = toml.server.max_concurrent_clients {
        config.max_concurrent_clients = max;
    }
    if let Some(level) = toml.server.log_level {
        config.log_level = level;
    }
    if let Some(v) = toml.server.heartbeat_interval_ms {
        config.heartbeat_interval = ms(v);
    }
    if let Some(v) = toml.server.client_timeout_ms {
        config.client_timeout = ms(v);
    }
    if let Some(v) = toml.server.cleanup_interval_ms {
        config.cleanup_interval = ms(v);
    }
    if let Some(v) = toml.server.connection_quality_interval_ms {
        config.connection_quality_interval = ms(v);
    }

    if let Some(history) = toml.clients.message_history {
        config.message_history = history;
    }
    if let Some(attempts) = toml.clients.max_reconnect_attempts {
        config.max_reconnect_attempts = attempts;
    }
    if let Some(v) = toml.clients.reconnect_delay_ms {
        config.reconnect_delay = ms(v);
    }

    if let Some(size) = toml.queue.size {
        config.message_queue_size = size;
    }
    if let Some(attempts) = toml.queue.retry_attempts {
        config.message_retry_attempts = attempts;
    }
    if let Some(v) = toml.queue.retry_interval_ms {
        config.message_retry_interval = ms(v);
    }
    if let Some(v) = toml.queue.retention_period_ms {
        config.message_retention_period = ms(v);
    }

    if let Some(enabled) = toml.compression.enabled {
        config.enable_compression = enabled;
    }
    if let Some(size) = toml.compression.min_size {
        config.compression_min_size = size;
    }
    if let Some(algorithm) = toml.compression.algorithm {
        config.compression_algorithm = algorithm;
    }
    if let Some(auto) = toml.compression.auto_select {
        config.auto_select_compression = auto;
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
}

/// Apply `EVENTCAST_*` environment overrides to `config`
///
/// Durations are given in milliseconds. Unparseable values are ignored.
pub fn apply_env_config(config: &mut ManagerConfig) {
    if let Some(v) = env_parse("EVENTCAST_HEARTBEAT_INTERVAL") {
        config.heartbeat_interval = Duration::from_millis(v);
    }
    if let Some(v) = env_parse("EVENTCAST_CLIENT_TIMEOUT") {
        config.client_timeout = Duration::from_millis(v);
    }
    if let Some(v) = env_parse("EVENTCAST_CLEANUP_INTERVAL") {
        config.cleanup_interval = Duration::from_millis(v);
    }
    if let Some(v) = env_parse("EVENTCAST_MAX_CLIENTS") {
        config.max_concurrent_clients = v;
    }
    if let Some(v) = env_parse("EVENTCAST_MAX_RECONNECT_ATTEMPTS") {
        config.max_reconnect_attempts = v;
    }
    if let Some(v) = env_parse("EVENTCAST_RECONNECT_DELAY") {
        config.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = env_parse("EVENTCAST_QUEUE_SIZE") {
        config.message_queue_size = v;
    }
    if let Some(v) = env_parse("EVENTCAST_RETRY_ATTEMPTS") {
        config.message_retry_attempts = v;
    }
    if let Some(v) = env_parse("EVENTCAST_RETRY_INTERVAL") {
        config.message_retry_interval = Duration::from_millis(v);
    }
    if let Some(enabled) = env_flag("EVENTCAST_COMPRESSION") {
        config.enable_compression = enabled;
    }
    if let Some(algorithm) = env_parse("EVENTCAST_COMPRESSION_ALGORITHM") {
        config.compression_algorithm = algorithm;
    }
    if let Some(level) = env_parse("EVENTCAST_LOG_LEVEL") {
        config.log_level = level;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();

        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.client_timeout, Duration::from_secs(60));
        assert_eq!(config.message_history, 50);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.message_queue_size, 1000);
        assert_eq!(config.message_retry_attempts, 3);
        assert_eq!(config.message_retry_interval, Duration::from_secs(10));
        assert_eq!(config.message_retention_period, Duration::from_secs(3600));
        assert_eq!(config.connection_quality_interval, Duration::from_secs(60));
        assert!(!config.enable_compression);
        assert_eq!(config.max_concurrent_clients, 1000);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.compression_min_size, 1024);
        assert_eq!(config.compression_algorithm, CompressionAlgorithm::Gzip);
        assert!(!config.auto_select_compression);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[server]
max_concurrent_clients = 20
log_level = "debug"
heartbeat_interval_ms = 1500
client_timeout_ms = 9000

[clients]
message_history = 5
max_reconnect_attempts = 2
reconnect_delay_ms = 250

[queue]
size = 16
retry_attempts = 7
retention_period_ms = 60000

[compression]
enabled = true
min_size = 64
algorithm = "brotli"
auto_select = true
"#;
        let parsed: EventcastToml = toml::from_str(toml_str).unwrap();
        let mut config = ManagerConfig::default();
        apply_toml_config(&mut config, &parsed);

        assert_eq!(config.max_concurrent_clients, 20);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(config.client_timeout, Duration::from_secs(9));
        assert_eq!(config.message_history, 5);
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.message_queue_size, 16);
        assert_eq!(config.message_retry_attempts, 7);
        assert_eq!(config.message_retention_period, Duration::from_secs(60));
        assert!(config.enable_compression);
        assert_eq!(config.compression_min_size, 64);
        assert_eq!(config.compression_algorithm, CompressionAlgorithm::Brotli);
        assert!(config.auto_select_compression);
        // untouched
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let parsed: EventcastToml = toml::from_str("[queue]\nsize = 3\n").unwrap();
        let mut config = ManagerConfig::default();
        apply_toml_config(&mut config, &parsed);

        assert_eq!(config.message_queue_size, 3);
        assert_eq!(config.message_retry_attempts, 3);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nmax_concurrent_clients = 42").unwrap();

        let config = load_config_from_path(Some(file.path())).unwrap();
        assert_eq!(config.max_concurrent_clients, 42);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");

        let config = load_config_from_path(Some(&path)).unwrap();
        assert_eq!(config.message_history, 50);
    }

    #[test]
    fn test_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server\nmax_concurrent_clients = ").unwrap();

        let result = load_config_from_path(Some(file.path()));
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_file_failing_validation() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nheartbeat_interval_ms = 0").unwrap();

        let result = load_config_from_path(Some(file.path()));
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = ManagerConfig {
            cleanup_interval: Duration::ZERO,
            ..ManagerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cleanup_interval"));

        let config = ManagerConfig::default().with_max_clients(0);
        assert!(config.validate().is_err());

        let config = ManagerConfig {
            message_retry_attempts: 0,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("EVENTCAST_QUEUE_SIZE", "77");
        std::env::set_var("EVENTCAST_COMPRESSION", "true");
        std::env::set_var("EVENTCAST_COMPRESSION_ALGORITHM", "deflate");

        let config = ManagerConfig::from_env();

        std::env::remove_var("EVENTCAST_QUEUE_SIZE");
        std::env::remove_var("EVENTCAST_COMPRESSION");
        std::env::remove_var("EVENTCAST_COMPRESSION_ALGORITHM");

        assert_eq!(config.message_queue_size, 77);
        assert!(config.enable_compression);
        assert_eq!(config.compression_algorithm, CompressionAlgorithm::Deflate);
    }

    #[test]
    fn test_config_error_display() {
        let read_err = ConfigError::ReadError {
            path: PathBuf::from("/tmp/eventcast.toml"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(read_err.to_string().contains("/tmp/eventcast.toml"));

        let validation_err = ConfigError::ValidationError("invalid value".to_string());
        assert!(validation_err.to_string().contains("invalid value"));
    }
}
