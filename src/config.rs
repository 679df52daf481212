//! # Configuration Management
//!
//! Centralized configuration for the relay client.
//!
//! This module provides structured configuration for the connection manager
//! (timeouts, reconnection, transfer chunk size), the transports (relay endpoint,
//! direct-socket defaults) and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Defaults
//! - Requests time out after 10 seconds
//! - A dropped connection is retried once every 8 seconds, without backoff
//! - Attachments are transferred in 2 MiB chunks

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Communications (major) version spoken by this client
pub const COMMUNICATIONS_VERSION: i32 = 5;

/// Relay service protocol version sent when opening the websocket
pub const RELAY_COMMUNICATIONS_VERSION: i32 = 1;

/// Size of a single attachment chunk, for uploads and downloads
pub const ATTACHMENT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Initial capacity of the shared outbound packer
pub const PACKER_CAPACITY: usize = 4 * 1024 * 1024;

/// Port used for direct connections when the address has none
pub const DEFAULT_DIRECT_PORT: u16 = 1359;

/// Largest frame accepted from a direct socket
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Main client configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ClientConfig {
    /// Connection manager configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
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

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("RELAY_PROTOCOL_RELAY_URL") {
            config.transport.relay_url = url;
        }

        if let Ok(timeout) = std::env::var("RELAY_PROTOCOL_REQUEST_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.request_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(interval) = std::env::var("RELAY_PROTOCOL_RECONNECT_INTERVAL_MS") {
            if let Ok(val) = interval.parse::<u64>() {
                config.connection.reconnect_interval = Duration::from_millis(val);
            }
        }

        if let Ok(auto) = std::env::var("RELAY_PROTOCOL_AUTO_RECONNECT") {
            if let Ok(val) = auto.parse::<bool>() {
                config.connection.auto_reconnect = val;
            }
        }

        if let Ok(level) = std::env::var("RELAY_PROTOCOL_LOG_LEVEL") {
            if let Ok(val) = level.parse::<Level>() {
                config.logging.log_level = val;
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
        errors.extend(self.connection.validate());
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

/// Connection manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Timeout for a correlated request to receive its response
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Delay before a passive reconnect after a recoverable close
    #[serde(with = "duration_serde")]
    pub reconnect_interval: Duration,

    /// Time allowed between transport open (or a version advertisement) and authentication
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Inactivity timeout for attachment downloads, refreshed on every chunk
    #[serde(with = "duration_serde")]
    pub download_timeout: Duration,

    /// Whether to automatically reconnect on a recoverable connection loss
    pub auto_reconnect: bool,

    /// Attachment chunk size in bytes
    pub chunk_size: usize,

    /// Inflate downloads as chunks arrive; when off, the compressed stream is returned as received
    #[serde(default = "default_inflate_downloads")]
    pub inflate_downloads: bool,
}

fn default_inflate_downloads() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: timeout::REQUEST_TIMEOUT,
            reconnect_interval: timeout::RECONNECT_INTERVAL,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            download_timeout: timeout::REQUEST_TIMEOUT,
            auto_reconnect: true,
            chunk_size: ATTACHMENT_CHUNK_SIZE,
            inflate_downloads: true,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.request_timeout.as_millis() < 100 {
            errors.push("Request timeout too short (minimum: 100ms)".to_string());
        } else if self.request_timeout.as_secs() > 300 {
            errors.push("Request timeout too long (maximum: 300s)".to_string());
        }

        if self.reconnect_interval.as_millis() < 10 {
            errors.push("Reconnect interval too short (minimum: 10ms)".to_string());
        } else if self.reconnect_interval.as_secs() > 600 {
            errors.push("Reconnect interval too long (maximum: 600s)".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.download_timeout.as_millis() < 100 {
            errors.push("Download timeout too short (minimum: 100ms)".to_string());
        }

        if self.chunk_size < 1024 {
            errors.push("Chunk size too small (minimum: 1 KB)".to_string());
        } else if self.chunk_size > i32::MAX as usize {
            errors.push(format!(
                "Chunk size too large: {} bytes (must fit in a signed 32-bit length)",
                self.chunk_size
            ));
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Relay websocket endpoint
    pub relay_url: String,

    /// Time allowed between the websocket opening and the relay confirming the connection
    #[serde(with = "duration_serde")]
    pub relay_handshake_timeout: Duration,

    /// Port used for direct connections when an address has none
    pub default_port: u16,

    /// Largest frame accepted from a direct socket or host bridge
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_url: String::from("wss://connect.example.com"),
            relay_handshake_timeout: timeout::RELAY_HANDSHAKE_TIMEOUT,
            default_port: DEFAULT_DIRECT_PORT,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.relay_url) {
            Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => {}
            Ok(url) => errors.push(format!(
                "Invalid relay URL scheme: '{}' (expected 'ws' or 'wss')",
                url.scheme()
            )),
            Err(e) => errors.push(format!("Invalid relay URL '{}': {e}", self.relay_url)),
        }

        if self.relay_handshake_timeout.as_millis() < 100 {
            errors.push("Relay handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.default_port == 0 {
            errors.push("Default port cannot be 0".to_string());
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > i32::MAX as usize {
            errors.push(format!(
                "Max frame size too large: {} bytes (must fit in a signed 32-bit length)",
                self.max_frame_size
            ));
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
            app_name: String::from("relay-protocol"),
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
                if let Some(parent) = Path::new(path).parent() {
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
