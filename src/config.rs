//! Configuration Module
//!
//! This module defines all configuration structures for the batcher.
//! Configuration is loaded from TOML files and parsed using serde.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
///
/// Contains all configuration sections for the batcher.
/// Loaded from a TOML file (e.g., config/default.toml).
///
/// # Example TOML
/// ```toml
/// [api]
/// host = "0.0.0.0"
/// port = 8000
/// public_url = "http://batcher"
/// webhooks_path = "webhooks"
///
/// [gateway]
/// url = "https://gatekeeper:2009/v0"
/// api_id = "003"
/// api_key = "secret"
///
/// [database]
/// url = "sqlite://data/batcher.sqlite?mode=rwc"
///
/// [batch]
/// default_batcher_id = 1
/// timeout_minutes = 60
/// check_threshold_minutes = 5
/// threshold_amount = 0.5
/// conf_target = 6
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub batch: BatchConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// API server configuration
///
/// # Fields
/// - `host`: IP address to bind to (e.g., "127.0.0.1" or "0.0.0.0")
/// - `port`: TCP port to listen on
/// - `public_url`: scheme and host under which the gateway can reach us
/// - `webhooks_path`: path of the endpoint receiving gateway callbacks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub public_url: String,
    #[serde(default = "default_webhooks_path")]
    pub webhooks_path: String,
}

impl ApiConfig {
    /// URL registered with the gateway for output callbacks.
    pub fn callback_url(&self) -> String {
        format!(
            "{}:{}/{}",
            self.public_url.trim_end_matches('/'),
            self.port,
            self.webhooks_path.trim_start_matches('/')
        )
    }
}

/// Wallet gateway connection configuration
///
/// # Fields
/// - `url`: base URL of the gateway API
/// - `api_id` / `api_key`: identity and HMAC secret used to sign each call
/// - `ca_file`: optional PEM certificate to trust for the gateway's TLS
/// - `timeout_secs`: timeout for every gateway call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub url: String,
    pub api_id: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Database configuration
///
/// # Fields
/// - `url`: sqlx SQLite URL (e.g., "sqlite://data/batcher.sqlite?mode=rwc"),
///   or `memory` for a non-persistent store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Batch execution configuration
///
/// Controls which batcher is used by default and when batches are executed.
///
/// # Fields
/// - `default_batcher_id`: gateway batcher used when a call names none
/// - `timeout_minutes`: period of the timeout trigger
/// - `check_threshold_minutes`: period of the threshold trigger
/// - `threshold_amount`: ongoing total that forces an early execution
/// - `conf_target`: confirmation target passed on scheduled executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub default_batcher_id: i64,
    pub timeout_minutes: u64,
    pub check_threshold_minutes: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub threshold_amount: Decimal,
    #[serde(default)]
    pub conf_target: Option<u32>,
}

impl BatchConfig {
    pub fn timeout_period(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    pub fn check_threshold_period(&self) -> Duration {
        Duration::from_secs(self.check_threshold_minutes.saturating_mul(60))
    }
}

/// Outbound webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_notifier_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_notifier_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_webhooks_path() -> String {
    "webhooks".to_string()
}

fn default_gateway_timeout() -> u64 {
    60
}

fn default_notifier_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    /// * `path` - Path to the TOML configuration file
    ///
    /// # Returns
    /// * `Ok(Config)` if the file was successfully loaded and parsed
    /// * `Err` if the file couldn't be read or the TOML is invalid
    ///
    /// # Example
    /// ```no_run
    /// # use batcher::Config;
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[api]
host = "127.0.0.1"
port = 8000
public_url = "http://batcher/"

[gateway]
url = "https://gatekeeper:2009/v0"
api_id = "003"
api_key = "topsecret"

[database]
url = "memory"

[batch]
default_batcher_id = 1
timeout_minutes = 60
check_threshold_minutes = 5
threshold_amount = 0.5
conf_target = 6
"#;

    #[test]
    fn test_load_applies_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.api.webhooks_path, "webhooks");
        assert_eq!(config.gateway.timeout_secs, 60);
        assert_eq!(config.notifier.timeout_secs, 30);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.batch.threshold_amount, dec!(0.5));
        assert_eq!(config.batch.timeout_period(), Duration::from_secs(3600));
        assert_eq!(config.batch.check_threshold_period(), Duration::from_secs(300));
    }

    #[test]
    fn test_callback_url() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.api.callback_url(), "http://batcher:8000/webhooks");
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert!(json["gateway"].get("api_key").is_none());
        assert_eq!(json["gateway"]["api_id"], "003");
    }

    #[test]
    fn test_huge_periods_saturate() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.batch.timeout_minutes = u64::MAX;
        config.batch.check_threshold_minutes = u64::MAX / 2;

        assert_eq!(config.batch.timeout_period(), Duration::from_secs(u64::MAX));
        assert_eq!(config.batch.check_threshold_period(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("does/not/exist.toml").is_err());
    }
}
