//! # Configuration Management
//!
//! Centralized configuration for nodes and their peers.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`PEER_PROTOCOL_*`)
//!
//! ## Timeouts
//! Every blocking point of a peer is bounded by one of three independent
//! timeouts: receive-wait (how long an inbound frame waits for a subscriber to
//! drain it), send-wait (how long a synchronous send may block) and
//! send-queue-busy (how long an asynchronous enqueue may wait for room).

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default capacity of each per-opcode inbound channel
pub const DEFAULT_RECEIVE_BUFFER: usize = 128;

/// Default capacity of the asynchronous outbound queue
pub const DEFAULT_SEND_QUEUE: usize = 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Node-level settings
    #[serde(default)]
    pub node: NodeConfig,

    /// Per-peer settings
    #[serde(default)]
    pub peer: PeerConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEER_PROTOCOL_ADDRESS") {
            config.node.address = addr;
        }

        if let Some(ms) = env_u64("PEER_PROTOCOL_RECEIVE_TIMEOUT_MS")? {
            config.peer.receive_message_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_u64("PEER_PROTOCOL_SEND_TIMEOUT_MS")? {
            config.peer.send_message_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_u64("PEER_PROTOCOL_SEND_BUSY_TIMEOUT_MS")? {
            config.peer.send_worker_busy_timeout = Duration::from_millis(ms);
        }

        if let Some(capacity) = env_u64("PEER_PROTOCOL_SEND_QUEUE_CAPACITY")? {
            config.peer.send_queue_capacity = capacity as usize;
        }

        if let Ok(level) = std::env::var("PEER_PROTOCOL_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
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
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.node.validate(self.transport.kind));
        errors.extend(self.peer.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("{key} must be an integer, got '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Node-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listen address. A socket address for TCP, any name for the memory transport.
    pub address: String,

    /// Maximum number of simultaneously registered peers (0 = unlimited)
    pub max_peers: usize,

    /// Timeout for establishing an outbound connection
    #[serde(with = "duration_serde")]
    pub dial_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:0"),
            max_peers: 0,
            dial_timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl NodeConfig {
    /// Validate node configuration
    pub fn validate(&self, kind: TransportKind) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Node address cannot be empty".to_string());
        } else if kind == TransportKind::Tcp
            && self.address.parse::<std::net::SocketAddr>().is_err()
        {
            errors.push(format!(
                "Invalid node address format: '{}' (expected format: '0.0.0.0:3000')",
                self.address
            ));
        }

        if self.max_peers > 100_000 {
            errors.push(format!(
                "Max peers very high: {} (ensure system resources can support this)",
                self.max_peers
            ));
        }

        if self.dial_timeout.as_millis() < 10 {
            errors.push("Dial timeout too short (minimum: 10ms)".to_string());
        } else if self.dial_timeout.as_secs() > 300 {
            errors.push("Dial timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Per-peer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PeerConfig {
    /// How long an inbound frame waits for its subscriber before being dropped
    #[serde(with = "duration_serde")]
    pub receive_message_timeout: Duration,

    /// How long a synchronous send may block
    #[serde(with = "duration_serde")]
    pub send_message_timeout: Duration,

    /// How long an asynchronous send waits for room in a full queue
    #[serde(with = "duration_serde")]
    pub send_worker_busy_timeout: Duration,

    /// Capacity of the asynchronous outbound queue
    pub send_queue_capacity: usize,

    /// Capacity of each per-opcode inbound channel
    pub receive_buffer_capacity: usize,

    /// Consecutive dropped inbound frames before the peer is disconnected (0 = never)
    pub max_dropped_frames: u32,

    /// Largest frame accepted or emitted, in bytes
    pub max_frame_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            receive_message_timeout: timeout::DEFAULT_TIMEOUT,
            send_message_timeout: timeout::DEFAULT_TIMEOUT,
            send_worker_busy_timeout: timeout::DEFAULT_TIMEOUT,
            send_queue_capacity: DEFAULT_SEND_QUEUE,
            receive_buffer_capacity: DEFAULT_RECEIVE_BUFFER,
            max_dropped_frames: 0,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl PeerConfig {
    /// Validate peer configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("Receive message timeout", self.receive_message_timeout),
            ("Send message timeout", self.send_message_timeout),
            ("Send worker busy timeout", self.send_worker_busy_timeout),
        ] {
            if value.is_zero() {
                errors.push(format!("{name} must be greater than 0"));
            } else if value.as_secs() > 300 {
                errors.push(format!("{name} too long (maximum: 300s)"));
            }
        }

        if self.send_queue_capacity == 0 {
            errors.push("Send queue capacity must be greater than 0".to_string());
        } else if self.send_queue_capacity > 1_000_000 {
            errors.push(format!(
                "Send queue capacity too large: {} (max recommended: 1,000,000)",
                self.send_queue_capacity
            ));
        }

        if self.receive_buffer_capacity == 0 {
            errors.push("Receive buffer capacity must be greater than 0".to_string());
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        errors
    }
}

/// Which transport a node runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Memory,
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport implementation
    pub kind: TransportKind,

    /// Disable Nagle's algorithm on TCP sockets
    pub tcp_nodelay: bool,

    /// In-flight byte capacity of each direction of a memory connection
    pub memory_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            tcp_nodelay: true,
            memory_buffer_size: 64 * 1024,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.kind == TransportKind::Memory && self.memory_buffer_size == 0 {
            errors.push("Memory buffer size must be greater than 0".to_string());
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

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peer-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations travel as integer milliseconds
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

/// Levels travel as lowercase names
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
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
