//! # Configuration Management
//!
//! Centralized configuration for the pooled transport.
//!
//! A single [`TransportConfig`] is built once at startup and handed to each component
//! constructor. There is no global settings object.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Sizing
//! The arena is the hard memory ceiling: `buffer_size * buffer_count` bytes are reserved
//! up front. Every TCP connection holds one receive buffer and every queued outbound
//! frame holds one more until it is written.

use crate::error::{Result, TransportError};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default size of one arena buffer, in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default number of buffers carved out of the arena
pub const DEFAULT_BUFFER_COUNT: usize = 4096;

/// Default interval after which an unacknowledged frame is resent
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(200);

/// Default tick of the background resend sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Top-level configuration for every transport component
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TransportConfig {
    /// Buffer arena sizing
    #[serde(default)]
    pub arena: ArenaConfig,

    /// TCP connection pool settings
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP session and reliability settings
    #[serde(default)]
    pub udp: UdpConfig,

    /// Lifecycle settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TransportConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            TransportError::ConfigError(format!("Failed to open config file: {e}"))
        })?;

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| {
            TransportError::ConfigError(format!("Failed to read config file: {e}"))
        })?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TransportError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("POOLED_TRANSPORT_TCP_ADDRESS") {
            config.tcp.address = addr;
        }

        if let Ok(addr) = std::env::var("POOLED_TRANSPORT_UDP_ADDRESS") {
            config.udp.address = addr;
        }

        if let Ok(size) = std::env::var("POOLED_TRANSPORT_BUFFER_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.arena.buffer_size = val;
            }
        }

        if let Ok(count) = std::env::var("POOLED_TRANSPORT_BUFFER_COUNT") {
            if let Ok(val) = count.parse::<usize>() {
                config.arena.buffer_count = val;
            }
        }

        if let Ok(capacity) = std::env::var("POOLED_TRANSPORT_MAX_CONNECTIONS") {
            if let Ok(val) = capacity.parse::<usize>() {
                config.tcp.max_connections = val;
            }
        }

        if let Ok(capacity) = std::env::var("POOLED_TRANSPORT_MAX_SESSIONS") {
            if let Ok(val) = capacity.parse::<usize>() {
                config.udp.max_sessions = val;
            }
        }

        if let Ok(resend) = std::env::var("POOLED_TRANSPORT_RESEND_INTERVAL_MS") {
            if let Ok(val) = resend.parse::<u64>() {
                config.udp.resend_interval = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            TransportError::ConfigError(format!("Failed to serialize config: {e}"))
        })?;

        std::fs::write(path, content).map_err(|e| {
            TransportError::ConfigError(format!("Failed to write config file: {e}"))
        })?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.arena.validate());
        errors.extend(self.tcp.validate());
        errors.extend(self.udp.validate());
        errors.extend(self.server.validate());
        errors.extend(self.logging.validate());

        // Cross-section checks
        if self.tcp.max_connections > self.arena.buffer_count {
            errors.push(format!(
                "Arena holds {} buffers but {} TCP connections each need a receive buffer",
                self.arena.buffer_count, self.tcp.max_connections
            ));
        }

        if self.udp.sweep_interval > self.udp.resend_interval {
            errors.push("Sweep interval should not exceed the resend interval".to_string());
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

/// Buffer arena sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArenaConfig {
    /// Size of each buffer in bytes; also the default frame size
    pub buffer_size: usize,

    /// Number of buffers pre-allocated in the arena
    pub buffer_count: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_count: DEFAULT_BUFFER_COUNT,
        }
    }
}

impl ArenaConfig {
    /// Validate arena configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.buffer_size < crate::core::frame::UDP_HEADER_SIZE {
            errors.push(format!(
                "Buffer size too small: {} (minimum: {} bytes for the UDP header)",
                self.buffer_size,
                crate::core::frame::UDP_HEADER_SIZE
            ));
        } else if self.buffer_size > crate::core::frame::MAX_FRAME_SIZE {
            errors.push(format!(
                "Buffer size too large: {} (maximum: {} bytes, the u16 length limit)",
                self.buffer_size,
                crate::core::frame::MAX_FRAME_SIZE
            ));
        }

        if self.buffer_count == 0 {
            errors.push("Buffer count must be greater than 0".to_string());
        }

        match self.buffer_size.checked_mul(self.buffer_count) {
            Some(total) if total > 1024 * 1024 * 1024 => errors.push(format!(
                "Arena too large: {total} bytes (maximum recommended: 1 GB)"
            )),
            None => errors.push("Arena size overflows usize".to_string()),
            _ => {}
        }

        errors
    }

    /// Total bytes reserved by the arena
    pub fn total_bytes(&self) -> usize {
        self.buffer_size.saturating_mul(self.buffer_count)
    }
}

/// TCP connection pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    /// Listen address (e.g., "127.0.0.1:7000")
    pub address: String,

    /// Capacity of the connection and event-context pools
    pub max_connections: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7000"),
            max_connections: 1000,
        }
    }
}

impl TcpConfig {
    /// Validate TCP configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_address("TCP", &self.address, &mut errors);

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }

    /// Validate and return Result
    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

/// UDP session and reliability settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    /// Bind address of the shared UDP socket
    pub address: String,

    /// Capacity of the reliability-context pool
    pub max_sessions: usize,

    /// Age after which an unacknowledged frame is resent
    #[serde(with = "duration_serde")]
    pub resend_interval: Duration,

    /// Tick of the background resend sweep
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Resends before a frame is abandoned (0 = never abandon)
    pub max_resend_attempts: u32,

    /// Maximum number of out-of-order frames buffered per session
    pub max_out_of_order: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7001"),
            max_sessions: 1000,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_resend_attempts: 50,
            max_out_of_order: 256,
        }
    }
}

impl UdpConfig {
    /// Validate UDP configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_address("UDP", &self.address, &mut errors);

        if self.max_sessions == 0 {
            errors.push("Max sessions must be greater than 0".to_string());
        }

        if self.resend_interval.as_millis() < 10 {
            errors.push("Resend interval too short (minimum: 10ms)".to_string());
        } else if self.resend_interval.as_secs() > 30 {
            errors.push("Resend interval too long (maximum: 30s)".to_string());
        }

        if self.sweep_interval.as_millis() < 1 {
            errors.push("Sweep interval too short (minimum: 1ms)".to_string());
        }

        if self.max_out_of_order == 0 {
            errors.push("Max out-of-order window must be greater than 0".to_string());
        } else if self.max_out_of_order > i16::MAX as usize {
            errors.push(format!(
                "Max out-of-order window too large: {} (maximum: {})",
                self.max_out_of_order,
                i16::MAX
            ));
        }

        errors
    }

    /// Validate and return Result
    pub fn validate_strict(&self) -> Result<()> {
        into_result(self.validate())
    }
}

/// Lifecycle settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Time allowed for pools and pipelines to drain on shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate lifecycle configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.shutdown_timeout.as_millis() < 100 {
            errors.push("Shutdown timeout too short (minimum: 100ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("pooled-transport"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

fn into_result(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TransportError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn validate_address(kind: &str, address: &str, errors: &mut Vec<String>) {
    if address.is_empty() {
        errors.push(format!("{kind} address cannot be empty"));
    } else if address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(format!(
            "Invalid {kind} address format: '{address}' (expected format: '0.0.0.0:7000')"
        ));
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
