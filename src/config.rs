//! Configuration management for Ratewarden.
//!
//! Values are layered: serde defaults, then an optional YAML file, then
//! `RATEWARDEN__*` environment variables (`__` separates nested keys, e.g.
//! `RATEWARDEN__STORE__REDIS_URL`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{RatewardenError, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Identify clients by `X-Forwarded-For` and similar headers
    #[serde(default = "default_trust_proxy_headers")]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_proxy_headers: default_trust_proxy_headers(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_trust_proxy_headers() -> bool {
    true
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; counts are not shared between instances
    #[default]
    Memory,
    /// Redis sorted sets
    Redis,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Redis => "redis",
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the in-memory store reclaims expired keys
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval() -> u64 {
    30
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML policy file extending the built-in presets
    pub policies_path: Option<String>,
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatewardenConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !Path::new(path).exists() {
                return Err(RatewardenError::Config(format!(
                    "configuration file '{}' not found",
                    path
                )));
            }
            builder = builder.add_source(config::File::with_name(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatewardenError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RatewardenConfig::default();

        assert_eq!(config.server.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert!(config.server.trust_proxy_headers);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout_ms, 250);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.rate_limiting.policies_path.is_none());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
server:
  listen_addr: 0.0.0.0:9000
store:
  backend: redis
  redis_url: redis://cache:6379/2
logging:
  format: json
"#;
        let config = RatewardenConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert!(config.server.trust_proxy_headers);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379/2");
        assert_eq!(config.store.timeout_ms, 250);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let yaml = "store:\n  backend: memcached\n";
        assert!(matches!(
            RatewardenConfig::from_yaml(yaml),
            Err(RatewardenError::Config(_))
        ));
    }

    #[test]
    fn test_missing_config_file_rejected() {
        assert!(RatewardenConfig::load(Some("/nonexistent/ratewarden.yaml")).is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = RatewardenConfig::load(None).unwrap();
        assert_eq!(config.store.sweep_interval_secs, 30);
    }

    #[test]
    fn test_load_layers_file_then_env() {
        let path = std::env::temp_dir().join(format!("ratewarden-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "store:\n  backend: redis\n  timeout_ms: 100\nlogging:\n  format: json\n",
        )
        .unwrap();

        std::env::set_var("RATEWARDEN__STORE__TIMEOUT_MS", "500");
        std::env::set_var("RATEWARDEN__SERVER__TRUST_PROXY_HEADERS", "false");
        let loaded = RatewardenConfig::load(path.to_str());
        std::env::remove_var("RATEWARDEN__STORE__TIMEOUT_MS");
        std::env::remove_var("RATEWARDEN__SERVER__TRUST_PROXY_HEADERS");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        // From the file
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.logging.format, LogFormat::Json);
        // Environment wins over the file
        assert_eq!(config.store.timeout_ms, 500);
        assert!(!config.server.trust_proxy_headers);
        // Defaults fill the rest
        assert_eq!(config.store.sweep_interval_secs, 30);
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(StoreBackend::Memory.as_str(), "memory");
        assert_eq!(StoreBackend::Redis.as_str(), "redis");
    }
}
