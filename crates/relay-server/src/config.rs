//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`relay.toml`, `/etc/relay/relay.toml`,
//!   `~/.config/relay/relay.toml`, first match wins)
//! - Environment variables: `RELAY__SECTION__KEY` for any field,
//!   `RELAY_HOST` / `RELAY_PORT` for the listen address

use anyhow::{bail, Context, Result};
use relay_broker::ConsumerConfig;
use relay_core::{ConnectionConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SEARCH_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client socket settings.
    #[serde(default)]
    pub socket: SocketConfig,

    /// Message broker settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Client socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,

    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,

    /// Outbound queue capacity per client.
    #[serde(default = "default_message_buffer_size")]
    pub message_buffer_size: usize,

    /// Largest accepted inbound message in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Read deadline in milliseconds. Pings go out at nine tenths of it.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Write deadline in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    #[serde(default = "default_publish_backoff")]
    pub publish_backoff_ms: u64,
}

/// Which broker implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Nsq,
    /// In-process; for a single node.
    Memory,
}

/// Message broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,

    /// nsqd HTTP address used for publishing.
    #[serde(default = "default_nsqd_http_address")]
    pub nsqd_http_address: String,

    /// nsqlookupd HTTP addresses used for discovery.
    #[serde(default = "default_lookupd_http_addresses")]
    pub lookupd_http_addresses: Vec<String>,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,

    #[serde(default = "default_lookupd_poll_interval")]
    pub lookupd_poll_interval_secs: u64,

    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Delay between subscription attempts while none is active.
    #[serde(default = "default_subscribe_retry")]
    pub subscribe_retry_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    1024
}

fn default_message_buffer_size() -> usize {
    256
}

fn default_max_message_size() -> usize {
    512
}

fn default_pong_wait() -> u64 {
    30_000 // 30 seconds
}

fn default_write_wait() -> u64 {
    5_000
}

fn default_publish_retries() -> u32 {
    3
}

fn default_publish_backoff() -> u64 {
    200
}

fn default_nsqd_http_address() -> String {
    "127.0.0.1:4151".to_string()
}

fn default_lookupd_http_addresses() -> Vec<String> {
    vec!["127.0.0.1:4161".to_string()]
}

fn default_topic() -> String {
    "Chat".to_string()
}

fn default_max_in_flight() -> u32 {
    10
}

fn default_lookupd_poll_interval() -> u64 {
    15
}

fn default_publish_timeout() -> u64 {
    5_000
}

fn default_subscribe_retry() -> u64 {
    5
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            socket: SocketConfig::default(),
            broker: BrokerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            message_buffer_size: default_message_buffer_size(),
            max_message_size: default_max_message_size(),
            pong_wait_ms: default_pong_wait(),
            write_wait_ms: default_write_wait(),
            publish_retries: default_publish_retries(),
            publish_backoff_ms: default_publish_backoff(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            nsqd_http_address: default_nsqd_http_address(),
            lookupd_http_addresses: default_lookupd_http_addresses(),
            topic: default_topic(),
            max_in_flight: default_max_in_flight(),
            lookupd_poll_interval_secs: default_lookupd_poll_interval(),
            publish_timeout_ms: default_publish_timeout(),
            subscribe_retry_secs: default_subscribe_retry(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl SocketConfig {
    /// Per-connection settings for the connection lifecycle.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            message_buffer_size: self.message_buffer_size,
            max_message_size: self.max_message_size,
            pong_wait: Duration::from_millis(self.pong_wait_ms),
            write_wait: Duration::from_millis(self.write_wait_ms),
            retry: RetryPolicy {
                retries: self.publish_retries,
                backoff: Duration::from_millis(self.publish_backoff_ms),
            },
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    #[must_use]
    pub fn subscribe_retry(&self) -> Duration {
        Duration::from_secs(self.subscribe_retry_secs.max(1))
    }

    /// Settings for the NSQ consumer.
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            lookupd_http_addresses: self.lookupd_http_addresses.clone(),
            lookupd_poll_interval: Duration::from_secs(self.lookupd_poll_interval_secs),
            max_in_flight: self.max_in_flight,
            ..ConsumerConfig::default()
        }
    }
}

impl Config {
    /// Load configuration from the first file found, or defaults, with
    /// `RELAY__*` environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or
    /// the result is invalid.
    pub fn load() -> Result<Self> {
        let file = SEARCH_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());
        Self::build(file.as_deref(), environment())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()), environment())
    }

    fn build(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }

        let location = file.map_or_else(|| "<defaults>".to_string(), |p| p.display().to_string());
        let config: Config = builder
            .add_source(env)
            .build()
            .and_then(|settings| settings.try_deserialize())
            .with_context(|| format!("Failed to load config: {}", location))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.socket.max_message_size == 0 {
            bail!("socket.max_message_size must be positive");
        }
        if self.socket.pong_wait_ms == 0 {
            bail!("socket.pong_wait_ms must be positive");
        }
        if self.socket.message_buffer_size == 0 {
            bail!("socket.message_buffer_size must be positive");
        }
        if self.broker.topic.is_empty() {
            bail!("broker.topic must not be empty");
        }
        if self.broker.kind == BrokerKind::Nsq {
            if self.broker.lookupd_http_addresses.is_empty() {
                bail!("broker.lookupd_http_addresses must not be empty");
            }
            if self.broker.max_in_flight == 0 {
                bail!("broker.max_in_flight must be positive");
            }
            if self.broker.lookupd_poll_interval_secs == 0 {
                bail!("broker.lookupd_poll_interval_secs must be positive");
            }
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("RELAY")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("broker.lookupd_http_addresses")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> config::Environment {
        environment().source(Some(Default::default()))
    }

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        environment().source(Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ))
    }

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.socket.message_buffer_size, 256);
        assert_eq!(config.socket.max_message_size, 512);
        assert_eq!(config.socket.read_buffer_size, 1024);
        assert_eq!(config.broker.topic, "Chat");
        assert_eq!(config.broker.max_in_flight, 10);
        assert_eq!(config.broker.kind, BrokerKind::Nsq);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_config() {
        let connection = SocketConfig::default().connection_config();
        assert_eq!(connection.pong_wait, Duration::from_secs(30));
        assert_eq!(connection.ping_period(), Duration::from_secs(27));
        assert_eq!(connection.write_wait, Duration::from_secs(5));
        assert_eq!(connection.retry.retries, 3);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [socket]
            max_message_size = 1024

            [broker]
            kind = "memory"
            topic = "Rooms"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.socket.max_message_size, 1024);
        assert_eq!(config.socket.pong_wait_ms, 30_000);
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.broker.topic, "Rooms");
    }

    #[test]
    fn test_build_defaults_without_file() {
        let config = Config::build(None, no_env()).unwrap();
        assert_eq!(config.broker.lookupd_http_addresses, vec!["127.0.0.1:4161"]);
        assert_eq!(config.metrics.port, 9090);
    }

    #[test]
    fn test_build_from_file_with_env_override() {
        let path = write_temp(
            "relay-config-override",
            r#"
                port = 9100

                [broker]
                topic = "FromFile"
                max_in_flight = 4
            "#,
        );

        let config = Config::build(
            Some(&path),
            env(&[
                ("RELAY__BROKER__TOPIC", "FromEnv"),
                ("RELAY__SOCKET__PONG_WAIT_MS", "10000"),
                ("RELAY__BROKER__LOOKUPD_HTTP_ADDRESSES", "a:4161,b:4161"),
            ]),
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.port, 9100);
        assert_eq!(config.broker.topic, "FromEnv");
        assert_eq!(config.broker.max_in_flight, 4);
        assert_eq!(config.socket.pong_wait_ms, 10_000);
        assert_eq!(config.broker.lookupd_http_addresses, vec!["a:4161", "b:4161"]);
    }

    #[test]
    fn test_build_missing_file() {
        let path = std::env::temp_dir().join("relay-config-does-not-exist.toml");
        assert!(Config::build(Some(&path), no_env()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.broker.topic.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.socket.max_message_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.broker.lookupd_http_addresses.clear();
        assert!(config.validate().is_err());
        config.broker.kind = BrokerKind::Memory;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.broker.lookupd_poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 8080;
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
    }
}
