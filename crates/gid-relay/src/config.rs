//! Configuration management

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    // Framing
    pub max_frame_size: usize,

    // Mailbox settings
    pub max_queue_length: usize,
    pub max_envelope_size: usize,

    /// Frames buffered per connection ahead of its writer. Must hold a
    /// full mailbox so the flush on registration never overflows.
    pub outbound_queue_capacity: usize,
    /// Consecutive full sends before a connection is evicted.
    pub max_outbound_overflows: usize,

    /// Reject registrations whose id does not match the public key.
    pub verify_agent_ids: bool,

    /// Serves `/health` and `/metrics` when set.
    pub metrics_addr: Option<SocketAddr>,

    // Graceful shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5555)),
            max_frame_size: gid_wire::DEFAULT_MAX_FRAME_SIZE,
            max_queue_length: 1000,
            max_envelope_size: gid_wire::DEFAULT_MAX_FRAME_SIZE,
            outbound_queue_capacity: 1024,
            max_outbound_overflows: 8,
            verify_agent_ids: true,
            metrics_addr: None,
            shutdown_timeout_secs: 10,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// Load configuration: defaults, then TOML file, then environment, then command line.
    ///
    /// The TOML file comes from `--config`/`-f` or `GID_RELAY_CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_args(std::env::args().skip(1))
    }

    pub fn load_from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();

        let config_path = flag_value(&args, &["--config", "-f"])?
            .map(PathBuf::from)
            .or_else(|| std::env::var("GID_RELAY_CONFIG").ok().map(PathBuf::from));

        let mut config = match config_path {
            Some(path) => Self::from_toml(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.apply_args(&args)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Override fields from `GID_RELAY_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(addr) = parse_env("GID_RELAY_BIND_ADDR")? {
            self.bind_addr = addr;
        }
        if let Some(size) = parse_env("GID_RELAY_MAX_FRAME_SIZE")? {
            self.max_frame_size = size;
        }
        if let Some(len) = parse_env("GID_RELAY_MAX_QUEUE_LENGTH")? {
            self.max_queue_length = len;
        }
        if let Some(size) = parse_env("GID_RELAY_MAX_ENVELOPE_SIZE")? {
            self.max_envelope_size = size;
        }
        if let Some(capacity) = parse_env("GID_RELAY_OUTBOUND_QUEUE_CAPACITY")? {
            self.outbound_queue_capacity = capacity;
        }
        if let Some(overflows) = parse_env("GID_RELAY_MAX_OUTBOUND_OVERFLOWS")? {
            self.max_outbound_overflows = overflows;
        }
        if let Some(verify) = parse_env("GID_RELAY_VERIFY_AGENT_IDS")? {
            self.verify_agent_ids = verify;
        }
        if let Some(addr) = parse_env("GID_RELAY_METRICS_ADDR")? {
            self.metrics_addr = Some(addr);
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &[String]) -> Result<(), ConfigError> {
        if let Some(addr) = flag_value(args, &["--listen-addr", "-l"])? {
            self.bind_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr: {}", e)))?;
        }
        if let Some(addr) = flag_value(args, &["--metrics-addr"])? {
            self.metrics_addr = Some(
                addr.parse()
                    .map_err(|e| ConfigError::Invalid(format!("Invalid metrics_addr: {}", e)))?,
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be > 0".to_string()));
        }

        if self.max_queue_length == 0 {
            return Err(ConfigError::Invalid("max_queue_length must be > 0".to_string()));
        }

        if self.max_envelope_size == 0 {
            return Err(ConfigError::Invalid("max_envelope_size must be > 0".to_string()));
        }

        if self.max_envelope_size > self.max_frame_size {
            return Err(ConfigError::Invalid(
                "max_envelope_size must not exceed max_frame_size".to_string(),
            ));
        }

        if self.outbound_queue_capacity < self.max_queue_length {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be at least max_queue_length".to_string(),
            ));
        }

        if self.max_outbound_overflows == 0 {
            return Err(ConfigError::Invalid("max_outbound_overflows must be > 0".to_string()));
        }

        if self.metrics_addr == Some(self.bind_addr) {
            return Err(ConfigError::Invalid(
                "metrics_addr must differ from bind_addr".to_string(),
            ));
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn flag_value(args: &[String], names: &[&str]) -> Result<Option<String>, ConfigError> {
    let mut found = None;
    let mut i = 0;
    while i < args.len() {
        if names.contains(&args[i].as_str()) {
            match args.get(i + 1) {
                Some(value) => found = Some(value.clone()),
                None => {
                    return Err(ConfigError::Invalid(format!("{} requires a value", args[i])));
                }
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.verify_agent_ids);
        assert_eq!(config.bind_addr.port(), 5555);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_addr = \"127.0.0.1:6000\"\nmax_queue_length = 5").unwrap();

        let config = ServerConfig::from_toml(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.max_queue_length, 5);
        assert_eq!(config.max_frame_size, gid_wire::DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_args_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_addr = \"127.0.0.1:6000\"").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config =
            ServerConfig::load_from_args(args(&["-f", &path, "--listen-addr", "127.0.0.1:7000"]))
                .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000".parse().unwrap());
    }

    #[test]
    fn test_missing_flag_value() {
        assert!(matches!(
            ServerConfig::load_from_args(args(&["-l"])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = ServerConfig {
            max_queue_length: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_envelope_size: ServerConfig::default().max_frame_size + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_outbound_queue_limits() {
        let config = ServerConfig {
            max_queue_length: 100,
            outbound_queue_capacity: 99,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_queue_length: 100,
            outbound_queue_capacity: 100,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = ServerConfig {
            max_outbound_overflows: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
