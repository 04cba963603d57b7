//! Server configuration.
//!
//! Sources, later ones overriding earlier ones:
//! - built-in defaults
//! - the first TOML file found in [`CONFIG_PATHS`], or an explicit `--config` path
//! - environment variables prefixed `TANDEM_`, nested with `__`
//!   (`TANDEM_PORT=9000`, `TANDEM_BUS__MAX_EVENT_HISTORY=500`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tandem_core::BusConfig;

/// Files checked when no explicit path is given.
pub const CONFIG_PATHS: [&str; 3] = [
    "tandem.toml",
    "/etc/tandem/tandem.toml",
    "~/.config/tandem/tandem.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Event bus options.
    pub bus: BusConfig,

    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    pub enabled: bool,

    /// Exporter port.
    pub port: u16,

    /// How often bus counters are copied into the exporter.
    pub refresh_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            bus: BusConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
            refresh_seconds: 15,
        }
    }
}

impl MetricsConfig {
    /// Exporter refresh interval, at least one second.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds.max(1))
    }
}

impl Config {
    /// Load configuration from the default paths and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let path = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());
        Self::build(path.as_deref())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        Self::build(Some(&path.to_string_lossy()))
    }

    fn build(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("TANDEM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(config::Config::try_deserialize)
            .with_context(|| match path {
                Some(path) => format!("Failed to load config file: {path}"),
                None => "Failed to load configuration from environment".to_string(),
            })?;

        config
            .bus
            .validate()
            .context("Invalid event bus configuration")?;
        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bus, BusConfig::default());
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let config = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [bus]
            max_event_history = 500
            rate_limit_burst = 20

            [metrics]
            enabled = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.bus.max_event_history, 500);
        assert_eq!(config.bus.rate_limit_burst, Some(20));
        assert_eq!(config.bus.max_connections, 100);
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/tandem.toml").is_err());
    }

    #[test]
    fn test_refresh_interval_floor() {
        let metrics = MetricsConfig {
            refresh_seconds: 0,
            ..MetricsConfig::default()
        };
        assert_eq!(metrics.refresh_interval(), Duration::from_secs(1));
    }
}
