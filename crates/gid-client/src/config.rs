//! Configuration management for gid-client
//!
//! Configuration is stored in TOML format.
//!
//! # Configuration File Locations
//!
//! - Unix: `~/.config/gid/client.toml`
//! - Windows: `%APPDATA%\gid\client.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionSettings;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Client configuration
///
/// # Example TOML
///
/// ```toml
/// [server]
/// host = "127.0.0.1"
/// port = 5555
///
/// [client]
/// auto_reconnect = true
/// reconnect_delay_secs = 5
/// max_reconnect_attempts = 10
/// save_history = true
/// typing_indicators = true
/// read_receipts = true
/// key_timeout_ms = 2000
///
/// [identity]
/// key_path = ""  # Empty = default location
///
/// [downloads]
/// dir = "downloads"
///
/// [logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub downloads: DownloadsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5555
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Session behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Reconnect after the relay drops the connection.
    ///
    /// Reconnection is not performed by the session itself; the binary
    /// reports this policy when a session ends.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_true")]
    pub save_history: bool,

    #[serde(default = "default_true")]
    pub typing_indicators: bool,

    #[serde(default = "default_true")]
    pub read_receipts: bool,

    /// Maximum wait for a public key lookup
    #[serde(default = "default_key_timeout_ms")]
    pub key_timeout_ms: u64,

    /// Reject keys whose derived id differs from the requested id
    #[serde(default = "default_true")]
    pub verify_peer_keys: bool,
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_key_timeout_ms() -> u64 {
    2000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            save_history: true,
            typing_indicators: true,
            read_receipts: true,
            key_timeout_ms: default_key_timeout_ms(),
            verify_peer_keys: true,
        }
    }
}

/// Identity configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Path to identity key file (empty = default location)
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// Where received files are written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    #[serde(default = "default_downloads_dir")]
    pub dir: PathBuf,
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            dir: default_downloads_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from custom path or default
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = custom_path {
            Self::load(path)
        } else {
            Self::load_default()
        }
    }

    /// Get default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "gid", "gid")
            .map(|dirs| dirs.config_dir().join("client.toml"))
    }

    /// Get the data directory path (for the identity file)
    pub fn data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "gid", "gid")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create default configuration file if it doesn't exist
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server.host must not be empty".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be greater than 0".to_string(),
            ));
        }

        if self.client.key_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "key_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// `host:port` of the relay
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            key_timeout: Duration::from_millis(self.client.key_timeout_ms),
            read_receipts: self.client.read_receipts,
            typing_indicators: self.client.typing_indicators,
            verify_peer_keys: self.client.verify_peer_keys,
            ..SessionSettings::default()
        }
    }

    /// Apply CLI overrides to configuration
    ///
    /// CLI arguments take precedence over config file values.
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Result<Self, ConfigError> {
        if let Some(ref server) = overrides.server {
            let (host, port) = parse_server(server)?;
            self.server.host = host;
            if let Some(port) = port {
                self.server.port = port;
            }
        }
        if let Some(true) = overrides.debug {
            self.logging.level = "debug".to_string();
        } else if let Some(true) = overrides.verbose {
            self.logging.level = "info".to_string();
        }
        Ok(self)
    }
}

/// Accepts `host` or `host:port`.
fn parse_server(value: &str) -> Result<(String, Option<u16>), ConfigError> {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("Invalid port in server address '{value}'"))
            })?;
            Ok((host.to_string(), Some(port)))
        }
        _ if value.is_empty() => Err(ConfigError::ValidationError(
            "server address must not be empty".to_string(),
        )),
        _ => Ok((value.to_string(), None)),
    }
}

/// CLI configuration overrides
///
/// Command-line arguments take precedence over config file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// `host[:port]` of the relay
    pub server: Option<String>,
    pub verbose: Option<bool>,
    pub debug: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5555);
        assert!(config.client.read_receipts);
        assert_eq!(config.client.key_timeout_ms, 2000);
        assert_eq!(config.downloads.dir, PathBuf::from("downloads"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("client.toml");

        let mut config = Config::default();
        config.server.port = 6001;
        config.client.typing_indicators = false;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.port, 6001);
        assert!(!loaded.client.typing_indicators);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("client.toml");
        std::fs::write(&path, "[server]\nhost = \"relay.example\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.host, "relay.example");
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_invalid_level_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("client.toml");
        std::fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_overrides() {
        let overrides = CliOverrides {
            server: Some("10.0.0.5:7000".to_string()),
            verbose: Some(true),
            debug: None,
        };
        let config = Config::default().with_overrides(&overrides).unwrap();
        assert_eq!(config.server_addr(), "10.0.0.5:7000");
        assert_eq!(config.logging.level, "info");

        let overrides = CliOverrides {
            server: Some("relay.local".to_string()),
            debug: Some(true),
            ..Default::default()
        };
        let config = Config::default().with_overrides(&overrides).unwrap();
        assert_eq!(config.server_addr(), "relay.local:5555");
        assert_eq!(config.logging.level, "debug");

        let bad = CliOverrides {
            server: Some("host:notaport".to_string()),
            ..Default::default()
        };
        assert!(Config::default().with_overrides(&bad).is_err());
    }

    #[test]
    fn test_session_settings_follow_config() {
        let mut config = Config::default();
        config.client.key_timeout_ms = 150;
        config.client.read_receipts = false;
        let settings = config.session_settings();
        assert_eq!(settings.key_timeout, Duration::from_millis(150));
        assert!(!settings.read_receipts);
    }
}
