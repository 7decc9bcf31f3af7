//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Distributed counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Deployment environment, consulted when the counter store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local or integration environments: fail open onto the in-process table.
    #[default]
    #[serde(alias = "dev", alias = "local", alias = "test")]
    Development,
    /// Production-like environments: fail closed.
    #[serde(alias = "prod", alias = "staging")]
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Ok(Environment::Development),
            "production" | "prod" | "staging" => Ok(Environment::Production),
            other => Err(TollgateError::Config(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Identifier of this replica, included in logs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            instance_id: default_instance_id(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Distributed counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Bound on connecting and on each counter operation, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            timeout_ms: default_store_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout() -> u64 {
    3000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Trust forwarded-for style headers set by a reverse proxy
    #[serde(default)]
    pub trust_proxy: bool,

    /// In development, fall back to the in-process table when the store fails.
    /// Production always fails closed.
    #[serde(default = "default_fallback_on_store_failure")]
    pub fallback_on_store_failure: bool,

    /// Interval between fallback table sweeps, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Per-limiter overrides keyed by limiter name
    #[serde(default)]
    pub overrides: HashMap<String, PolicyOverride>,
}

impl RateLimitingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            trust_proxy: false,
            fallback_on_store_failure: default_fallback_on_store_failure(),
            sweep_interval_secs: default_sweep_interval(),
            overrides: HashMap::new(),
        }
    }
}

fn default_fallback_on_store_failure() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

/// Replacement values for one entry of the limiter registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    /// Replaces the skipped exact paths when present
    #[serde(default)]
    pub skip_paths: Option<Vec<String>>,
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file layered under
    /// `TOLLGATE__SECTION__FIELD` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TOLLGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "rate_limiting.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.store.timeout(), Duration::from_secs(3));
        assert_eq!(config.rate_limiting.environment, Environment::Development);
        assert!(!config.rate_limiting.trust_proxy);
        assert!(config.rate_limiting.fallback_on_store_failure);
        assert_eq!(config.rate_limiting.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
store:
  redis_url: "redis://cache:6379/2"
  timeout_ms: 500
rate_limiting:
  environment: prod
  trust_proxy: true
  overrides:
    auth:
      limit: 10
      message: "Slow down"
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.store.redis_url, "redis://cache:6379/2");
        assert_eq!(config.store.timeout(), Duration::from_millis(500));
        assert_eq!(config.rate_limiting.environment, Environment::Production);
        assert!(config.rate_limiting.trust_proxy);

        let auth = &config.rate_limiting.overrides["auth"];
        assert_eq!(auth.limit, Some(10));
        assert_eq!(auth.window_ms, None);
        assert_eq!(auth.message.as_deref(), Some("Slow down"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = r#"
store:
  timeout_ms: 0
"#;
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_environment_from_str() {
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
        assert!("qa-cluster".parse::<Environment>().is_err());
    }
}
