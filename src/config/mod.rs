//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection settings
    pub broker: BrokerConfig,
    /// Exposed proxy service
    pub proxy: ProxyConfig,
    /// Heartbeat settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address (IP or hostname)
    pub server_addr: String,
    /// Broker control port
    pub server_port: u16,
    /// Shared authentication token
    pub auth_token: String,
    /// Fixed session identifier; when unset it is derived from the
    /// device's network MAC
    #[serde(default)]
    pub run_id: Option<String>,
}

/// The local service the broker should expose
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Name the proxy registers under
    pub proxy_name: String,
    /// Proxy type (tcp, udp, http, https)
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
    /// Local service address
    #[serde(default = "default_local_address")]
    pub local_address: String,
    /// Local service port
    pub local_port: u16,
    /// Port the broker binds remotely
    pub remote_port: u16,
    /// Ask the broker to encrypt relayed traffic
    #[serde(default)]
    pub use_encryption: bool,
    /// Ask the broker to compress relayed traffic
    #[serde(default)]
    pub use_compression: bool,
}

fn default_proxy_type() -> String {
    "tcp".to_string()
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

/// Heartbeat settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between pings
    pub interval_secs: u16,
    /// Seconds of pong silence before the session is declared dead
    pub timeout_secs: u16,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 40,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [broker]
            server_addr = "203.0.113.5"
            server_port = 7000
            auth_token = "52010"

            [proxy]
            proxy_name = "device"
            local_port = 80
            remote_port = 8080
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.broker.server_port, 7000);
        assert_eq!(config.proxy.proxy_type, "tcp");
        assert_eq!(config.proxy.local_address, "127.0.0.1");
        assert!(!config.proxy.use_encryption);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.heartbeat.timeout_secs, 40);
        assert_eq!(config.logging.level, "info");
    }
}
