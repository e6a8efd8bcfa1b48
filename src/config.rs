//! Configuration
//!
//! Configuration structures for server and client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
    #[serde(default = "default_typing_timeout_secs")]
    pub typing_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("huddle-snapshot.json")
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

fn default_session_retention_secs() -> u64 {
    3600
}

fn default_typing_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8790,
            snapshot_path: default_snapshot_path(),
            snapshot_interval_secs: 30,
            session_retention_secs: 3600,
            typing_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_secs(self.typing_timeout_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_host: String,
    pub port: u16,
    #[serde(default = "default_username")]
    pub default_username: String,
    #[serde(default)]
    pub call: CallConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_username() -> String {
    "User".to_string()
}

/// Call timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(default = "default_answer_timeout_secs")]
    pub answer_timeout_secs: u64,
    #[serde(default = "default_reconnect_base_delay_secs")]
    pub reconnect_base_delay_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_answer_timeout_secs() -> u64 {
    30
}

fn default_reconnect_base_delay_secs() -> u64 {
    2
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            answer_timeout_secs: 30,
            reconnect_base_delay_secs: 2,
            max_reconnect_attempts: 3,
        }
    }
}

impl CallConfig {
    pub fn tuning(&self) -> crate::call::CallTuning {
        crate::call::CallTuning {
            answer_timeout: Duration::from_secs(self.answer_timeout_secs),
            reconnect_base_delay: Duration::from_secs(self.reconnect_base_delay_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            port: 8790,
            default_username: "User".to_string(),
            call: CallConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8790);
        assert_eq!(config.snapshot_interval_secs, 30);
        assert_eq!(config.session_retention_secs, 3600);
    }

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server_host, "127.0.0.1");
        assert_eq!(config.call.answer_timeout_secs, 30);
        assert_eq!(config.call.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ServerConfig =
            toml::from_str("host = \"127.0.0.1\"\nport = 9000\n").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.typing_timeout_secs, 10);
    }

    #[test]
    fn test_call_tuning_conversion() {
        let tuning = CallConfig::default().tuning();
        assert_eq!(tuning.answer_timeout, Duration::from_secs(30));
        assert_eq!(tuning.reconnect_base_delay, Duration::from_secs(2));
    }
}
