//! Server configuration.
//!
//! Everything has a default, so `Config::default()` is a working setup. A
//! TOML file can override any subset:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! idle_timeout = 5
//! max_connections = 2048
//! shutdown_grace = 10
//!
//! [limits]
//! max_field_size = 8192
//! read_buffer_size = 16384
//!
//! [logging]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Complete server configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection lifecycle settings.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds a kept-alive connection may sit idle between requests
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Connections served at once; further accepts wait for a free slot
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds in-flight requests get to finish after shutdown begins
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            idle_timeout: default_idle_timeout(),
            max_connections: default_max_connections(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Parser and I/O sizing.
#[derive(Clone, Debug, Deserialize)]
pub struct LimitsConfig {
    /// Longest accepted request line, header line or chunk-size line
    #[serde(default = "default_max_field_size")]
    pub max_field_size: usize,
    /// Bytes requested from the socket per read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_field_size: default_max_field_size(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_listen() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    10_000
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_max_field_size() -> usize {
    crate::parser::DEFAULT_MAX_FIELD_SIZE
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Parses a TOML document. Missing tables and keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::TomlParse(None, e))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(Some(path.to_path_buf()), e))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.server.idle_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config{}: {}", file_suffix(.0), .1)]
    TomlParse(Option<PathBuf>, #[source] toml::de::Error),
}

fn file_suffix(path: &Option<PathBuf>) -> String {
    path.as_ref().map(|p| format!(" file '{}'", p.display())).unwrap_or_default()
}
