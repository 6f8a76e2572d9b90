use crate::broker::AckMode;
use crate::resilience::RetryPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted for the broker URL, matching the
/// deployment convention of the surrounding services.
pub const BROKER_URL_ENV: &str = "RABBITMQ_URL";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub replica: ReplicaConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    #[serde(default = "default_publish_attempts")]
    pub connect_attempts: usize,
    #[serde(default = "default_publish_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub ack_mode: AckMode,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_apply_attempts")]
    pub apply_attempts: usize,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default)]
    pub reconnect_jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicaConfig {
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl Config {
    /// Loads the optional file, then `CATALOG_SYNC__*` variables, then
    /// [`BROKER_URL_ENV`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("CATALOG_SYNC")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("broker.url", std::env::var(BROKER_URL_ENV).ok())
            .and_then(|b| b.build())
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.url.trim().is_empty() {
            return Err(Error::Config("broker.url must not be empty".to_string()));
        }
        if self.broker.exchange.trim().is_empty() {
            return Err(Error::Config("broker.exchange must not be empty".to_string()));
        }
        if self.publisher.connect_attempts == 0 {
            return Err(Error::Config(
                "publisher.connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.consumer.apply_attempts == 0 {
            return Err(Error::Config(
                "consumer.apply_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consumer.reconnect_jitter) {
            return Err(Error::Config(
                "consumer.reconnect_jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl PublisherConfig {
    /// Bounded and fixed: a publish must not stall the request that caused it.
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry_delay_ms);
        RetryPolicy {
            max_attempts: self.connect_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            jitter: 0.0,
        }
    }
}

impl ConsumerConfig {
    /// Unbounded; the consumer never gives up on the broker.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        let initial_delay = Duration::from_millis(self.reconnect_delay_ms);
        let max_delay =
            Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_delay_ms));
        RetryPolicy {
            max_attempts: usize::MAX,
            initial_delay,
            max_delay,
            backoff_factor: if max_delay > initial_delay { 2.0 } else { 1.0 },
            jitter: self.reconnect_jitter,
        }
    }
}

impl ReplicaConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            exchange: default_exchange(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_publish_attempts(),
            retry_delay_ms: default_publish_retry_delay_ms(),
            persistent: default_persistent(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::default(),
            prefetch: default_prefetch(),
            apply_attempts: default_apply_attempts(),
            dead_letter_exchange: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter: 0.0,
        }
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

fn default_broker_url() -> String {
    "amqp://rabbitmq:5672/%2f".to_string()
}

fn default_exchange() -> String {
    "book_events".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_publish_attempts() -> usize {
    5
}

fn default_publish_retry_delay_ms() -> u64 {
    2_000
}

fn default_persistent() -> bool {
    true
}

fn default_prefetch() -> u16 {
    32
}

fn default_apply_attempts() -> usize {
    3
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    5_000
}

fn default_snapshot_interval_secs() -> u64 {
    30
}
