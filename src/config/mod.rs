use crate::rpc::PoolOptions;
use crate::utils::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolOptions,
    #[serde(default)]
    pub dial: DialConfig,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Backend addresses whose pools are built at startup
    #[serde(default)]
    pub upstreams: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// TCP keepalive idle time, 0 disables keepalive
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_leak_sweep_interval_secs")]
    pub leak_sweep_interval_secs: u64,
    #[serde(default = "default_leak_threshold_secs")]
    pub leak_threshold_secs: u64,
    #[serde(default = "default_retired_capacity")]
    pub retired_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_bind_port")]
    pub bind_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values
fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_nodelay() -> bool {
    true
}

fn default_max_frame_length() -> usize {
    8 * 1024 * 1024
}

fn default_leak_sweep_interval_secs() -> u64 {
    30 * 60
}

fn default_leak_threshold_secs() -> u64 {
    30 * 60
}

fn default_retired_capacity() -> usize {
    1024
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_bind_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            nodelay: default_nodelay(),
            max_frame_length: default_max_frame_length(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            leak_sweep_interval_secs: default_leak_sweep_interval_secs(),
            leak_threshold_secs: default_leak_threshold_secs(),
            retired_capacity: default_retired_capacity(),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            bind_address: default_api_bind_address(),
            bind_port: default_api_bind_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        if self.dial.connect_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "dial connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.registry.leak_sweep_interval_secs == 0 || self.registry.leak_threshold_secs == 0
        {
            return Err(GatewayError::Config(
                "registry leak intervals must be greater than 0".to_string(),
            ));
        }

        if self.registry.retired_capacity == 0 {
            return Err(GatewayError::Config(
                "registry retired_capacity must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(GatewayError::Config(format!(
                "Invalid log format: {}. Must be 'pretty' or 'json'",
                self.logging.format
            )));
        }

        if let Some(empty) = self.upstreams.iter().position(|u| u.trim().is_empty()) {
            return Err(GatewayError::Config(format!(
                "upstreams[{}] cannot be empty",
                empty
            )));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"# Backends whose pools are warmed up at startup
upstreams = ["127.0.0.1:7001"]

[pool]
max_idle = 1
max_active = 64
max_concurrent_streams = 64
reuse = true  # false: dial one-time connections once max_active is reached

[dial]
connect_timeout_ms = 5000
keepalive_secs = 60  # 0 disables TCP keepalive
nodelay = true
max_frame_length = 8388608

[registry]
leak_sweep_interval_secs = 1800
leak_threshold_secs = 1800
retired_capacity = 1024

[api]
enabled = true
bind_address = "127.0.0.1"
bind_port = 9090

[logging]
level = "info"  # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example).map_err(|e| {
            GatewayError::Config(format!("Failed to write example config: {}", e))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.max_idle, 1);
        assert!(config.pool.reuse);
        assert_eq!(config.registry.leak_threshold_secs, 1800);
        assert_eq!(config.api.bind_port, 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.pool.max_idle = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.max_idle = 8;
        config.pool.max_active = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.upstreams = vec!["10.0.0.1:9000".to_string(), " ".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.registry.leak_threshold_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn example_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tradegate.toml");

        Config::create_example(&path).unwrap();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.upstreams, vec!["127.0.0.1:7001".to_string()]);
        assert_eq!(config.pool.max_active, 64);
        assert_eq!(config.dial.keepalive_secs, 60);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: Config = toml::from_str("[pool]\nmax_active = 4\n").unwrap();
        assert_eq!(config.pool.max_active, 4);
        assert_eq!(config.pool.max_idle, 1);
        assert_eq!(config.dial.connect_timeout_ms, 5000);
        assert!(config.upstreams.is_empty());
    }
}
