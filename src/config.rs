//! Service and runner configuration.
//!
//! Configuration is loaded from YAML files and environment variables via
//! the `config` crate; every field has a default so a bare
//! `ServiceConfig::new("name")` is enough for local development.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";

/// Default broker URL.
pub const DEFAULT_BROKER_URL: &str = "nats://localhost:4222";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration load failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of a single service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Unique service name; required, used in subject derivation.
    pub name: String,
    /// Broker URL.
    pub broker_url: String,
    /// RPC request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Bounded initial connection attempts.
    pub max_reconnect_attempts: u32,
    /// Cap on the backoff between connection attempts, in milliseconds.
    pub reconnect_wait_ms: u64,
    /// Restart this service when it fails (under a runner).
    pub auto_restart: bool,
    /// Delay before a restart attempt, in milliseconds.
    pub restart_delay_ms: u64,
    /// Restart budget before the service is marked degraded.
    pub max_restart_attempts: u32,
    /// Grace period for in-flight handlers during stop, in milliseconds.
    pub stop_grace_ms: u64,
    /// Co-hosted HTTP listener port (feature `http`).
    pub http_port: Option<u16>,
    /// Co-hosted WebSocket listener port (feature `http`).
    pub websocket_port: Option<u16>,
    /// Debug backdoor port; accepted for compatibility, no listener.
    pub backdoor_port: Option<u16>,
    /// Accepted and logged; durable streams are not implemented.
    pub jetstream_enabled: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            broker_url: DEFAULT_BROKER_URL.to_string(),
            request_timeout_ms: 5_000,
            max_reconnect_attempts: 10,
            reconnect_wait_ms: 2_000,
            auto_restart: true,
            restart_delay_ms: 1_000,
            max_restart_attempts: 5,
            stop_grace_ms: 5_000,
            http_port: None,
            websocket_port: None,
            backdoor_port: None,
            jetstream_enabled: false,
        }
    }
}

impl ServiceConfig {
    /// Create a config with defaults and the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in the current directory (if it exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `COURIER_CONFIG` environment variable (if set)
    /// 4. Environment variables with the `COURIER` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ServiceConfig = loaded.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that defaults cannot guarantee.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("service name is required".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Configuration of the service runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Share one broker connection between services with the same URL.
    pub share_connections: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            share_connections: false,
        }
    }
}
