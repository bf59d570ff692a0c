//! Configuration
//!
//! TOML configuration for the bridge process with support for:
//! - Logging
//! - Engine-wide bridge settings (timeouts, buffer bounds, backoff)
//! - Metrics endpoint
//! - Named credentials
//! - Transfers started at boot
//! - Environment variable overrides (UABRIDGE__* prefix)

use std::collections::HashMap;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::credentials::{Credential, StaticCredentials};

pub use bridge::{BackoffConfig, BridgeConfig};
pub use metrics::MetricsConfig;
pub use transfer::{
    BrokerAddress, NodeSpec, SecurityMode, SecurityPolicy, SinkSpec, SourceSpec, SpecError,
    TransferSpec, EDC_NAMESPACE,
};

mod bridge;
mod metrics;
mod transfer;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern");
    re.replace_all(content, |caps: &regex::Captures| {
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub bridge: BridgeConfig,
    pub metrics: MetricsConfig,
    /// Named credentials referenced by transfers
    pub credentials: HashMap<String, Credential>,
    /// Transfers started when the process boots
    #[serde(rename = "transfer")]
    pub transfers: Vec<TransferSpec>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `UABRIDGE__` prefix with double underscores for nesting:
    ///    - `UABRIDGE__BRIDGE__DRAIN_TIMEOUT=10s` overrides `bridge.drain_timeout`
    ///    - `UABRIDGE__BRIDGE__BACKOFF__MAX_FAILURES=8` overrides `bridge.backoff.max_failures`
    ///    - `UABRIDGE__METRICS__ENABLED=true` overrides `metrics.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("bridge.channel_capacity", 1000)?
            .set_default("bridge.connect_timeout", "10s")?
            .set_default("bridge.drain_timeout", "5s")?
            .set_default("bridge.backpressure_window", "30s")?
            .set_default("bridge.max_inflight", 32)?
            .set_default("bridge.keep_alive", 60)?
            .set_default("bridge.backoff.initial", "1s")?
            .set_default("bridge.backoff.max", "30s")?
            .set_default("bridge.backoff.jitter", 0.2)?
            .set_default("bridge.backoff.max_failures", 5)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9464")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("UABRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only (no file)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bridge = &self.bridge;
        if bridge.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "bridge.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if bridge.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "bridge.max_inflight must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&bridge.backoff.jitter) {
            return Err(ConfigError::Validation(
                "bridge.backoff.jitter must be between 0 and 1".to_string(),
            ));
        }
        if bridge.backoff.initial > bridge.backoff.max {
            return Err(ConfigError::Validation(
                "bridge.backoff.initial cannot exceed bridge.backoff.max".to_string(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for transfer in &self.transfers {
            transfer
                .validate()
                .map_err(|e| ConfigError::Validation(format!("transfer '{}': {}", transfer.id, e)))?;

            if !ids.insert(transfer.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "transfer '{}' is defined more than once",
                    transfer.id
                )));
            }

            let references = [
                transfer.source.credentials.as_ref(),
                transfer.sink.credentials.as_ref(),
            ];
            for reference in references.into_iter().flatten() {
                if !self.credentials.contains_key(reference) {
                    return Err(ConfigError::Validation(format!(
                        "transfer '{}' references unknown credentials '{}'",
                        transfer.id, reference
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolver over the `[credentials]` table
    pub fn credential_resolver(&self) -> StaticCredentials {
        StaticCredentials::new(self.credentials.clone())
    }
}
