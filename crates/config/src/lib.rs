//! Configuration management for kafka-bridge
//!
//! Every section has sensible defaults so a partial YAML file (or nothing but
//! environment variables) yields a usable configuration. Durations are written
//! as integer milliseconds.
//!
//! ```rust,no_run
//! use bridge_config::BridgeConfig;
//!
//! let config = BridgeConfig::load(Some("bridge.yaml".into())).unwrap();
//! config.validate().unwrap();
//! ```

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Environment variable prefix, nested keys are separated by `__`
/// (`BRIDGE_CONSUMER__GROUP_ID=orders`).
pub const ENV_PREFIX: &str = "BRIDGE_";

/// Top-level bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Broker consumer settings
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Broker producer settings
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Offset committer backend
    #[serde(default)]
    pub committer: CommitterConfig,

    /// Commit sink batching
    #[serde(default)]
    pub commit_sink: CommitSinkConfig,

    /// Demand-driven source
    #[serde(default)]
    pub source: SourceConfig,

    /// Demand-driven sink
    #[serde(default)]
    pub sink: SinkConfig,

    /// Restart / escalation policy
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl BridgeConfig {
    /// Load configuration from an optional YAML file, then environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.consumer.validate()?;
        self.producer.validate()?;
        self.committer.validate()?;
        self.commit_sink.validate()?;
        self.source.validate()?;
        self.sink.validate()?;
        self.supervisor.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

// ---------------------------------------------------------------------------
// Consumer / producer
// ---------------------------------------------------------------------------

/// Broker consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Broker addresses (host:port)
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,

    /// Consumer group that owns the committed offsets
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Topics to subscribe to
    #[serde(default)]
    pub topics: Vec<String>,

    /// What to do without a committed offset: "earliest", "latest", "none"
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Upper bound for a single broker fetch
    #[serde(default = "default_fetch_timeout", with = "duration_millis")]
    pub fetch_timeout: Duration,

    /// Raw client properties passed through to the broker client
    #[serde(default)]
    pub additional_properties: HashMap<String, String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            group_id: default_group_id(),
            topics: Vec::new(),
            auto_offset_reset: default_auto_offset_reset(),
            fetch_timeout: default_fetch_timeout(),
            additional_properties: HashMap::new(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(invalid("consumer.bootstrap_servers cannot be empty"));
        }
        if self.group_id.is_empty() {
            return Err(invalid("consumer.group_id cannot be empty"));
        }
        if self.topics.is_empty() {
            return Err(invalid("consumer.topics cannot be empty"));
        }
        if !["earliest", "latest", "none"].contains(&self.auto_offset_reset.as_str()) {
            return Err(invalid(format!(
                "invalid consumer.auto_offset_reset: {}. Must be 'earliest', 'latest', or 'none'",
                self.auto_offset_reset
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(invalid("consumer.fetch_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Broker producer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Broker addresses (host:port)
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,

    /// Client id reported to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Acknowledgment level: "0", "1" or "all"
    #[serde(default = "default_acks")]
    pub acks: String,

    /// Delivery timeout for one record
    #[serde(default = "default_send_timeout", with = "duration_millis")]
    pub send_timeout: Duration,

    /// Raw client properties passed through to the broker client
    #[serde(default)]
    pub additional_properties: HashMap<String, String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            acks: default_acks(),
            send_timeout: default_send_timeout(),
            additional_properties: HashMap::new(),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(invalid("producer.bootstrap_servers cannot be empty"));
        }
        if !["0", "1", "all", "-1"].contains(&self.acks.as_str()) {
            return Err(invalid(format!(
                "invalid producer.acks: {}. Must be '0', '1', or 'all'",
                self.acks
            )));
        }
        if self.send_timeout.is_zero() {
            return Err(invalid("producer.send_timeout must be greater than 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Offset commit
// ---------------------------------------------------------------------------

/// Where committed offsets are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitterBackend {
    /// The broker's own offset storage
    #[default]
    Kafka,
    /// Coordination service keys guarded by per-partition locks
    Coordinated,
}

/// How a stored offset and a proposed offset are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicyKind {
    /// The committing caller's value replaces whatever is stored
    #[default]
    CallerWins,
    /// The larger of the two values is kept
    HighestWins,
}

/// Offset committer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitterConfig {
    #[serde(default)]
    pub backend: CommitterBackend,

    /// Coordination service URL (coordinated backend only)
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Root namespace for offset and lock keys
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Bounded wait for `start()` to reach the backing store
    #[serde(default = "default_connect_timeout", with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Bounded wait for one partition lock
    #[serde(default = "default_lock_timeout", with = "duration_millis")]
    pub lock_timeout: Duration,

    /// Expiry of a held lock if its owner disappears
    #[serde(default = "default_lock_ttl", with = "duration_millis")]
    pub lock_ttl: Duration,

    #[serde(default)]
    pub merge_policy: MergePolicyKind,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            backend: CommitterBackend::default(),
            redis_url: default_redis_url(),
            namespace: default_namespace(),
            connect_timeout: default_connect_timeout(),
            lock_timeout: default_lock_timeout(),
            lock_ttl: default_lock_ttl(),
            merge_policy: MergePolicyKind::default(),
        }
    }
}

impl CommitterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == CommitterBackend::Coordinated && self.redis_url.is_empty() {
            return Err(invalid(
                "committer.redis_url required for the coordinated backend",
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(invalid(
                "committer.namespace must be non-empty and must not contain '/'",
            ));
        }
        if self.connect_timeout.is_zero() || self.lock_timeout.is_zero() {
            return Err(invalid(
                "committer.connect_timeout and committer.lock_timeout must be greater than 0",
            ));
        }
        if self.lock_ttl < self.lock_timeout {
            return Err(invalid(
                "committer.lock_ttl must be at least committer.lock_timeout",
            ));
        }
        Ok(())
    }
}

/// Commit sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSinkConfig {
    /// Interval between periodic flushes
    #[serde(default = "default_commit_interval", with = "duration_millis")]
    pub commit_interval: Duration,
}

impl Default for CommitSinkConfig {
    fn default() -> Self {
        Self {
            commit_interval: default_commit_interval(),
        }
    }
}

impl CommitSinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.commit_interval.is_zero() {
            return Err(invalid("commit_sink.commit_interval must be greater than 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Demand-driven source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Largest number of records asked of the broker in one fetch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Records that may be fetched ahead of downstream demand
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Consecutive retryable fetch failures tolerated before failing
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,

    #[serde(default = "default_retry_backoff", with = "duration_millis")]
    pub retry_backoff: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            prefetch: default_prefetch(),
            max_fetch_retries: default_max_fetch_retries(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(invalid("source.max_batch_size must be greater than 0"));
        }
        Ok(())
    }
}

/// Demand-driven sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Outstanding elements to refill up to
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,

    /// Outstanding elements below which more are requested
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.low_watermark == 0 || self.low_watermark >= self.high_watermark {
            return Err(invalid(format!(
                "sink watermarks must satisfy 0 < low ({}) < high ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

/// Supervisor restart policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Failures tolerated inside `within` before escalating
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Sliding window the failures are counted in
    #[serde(default = "default_within", with = "duration_millis")]
    pub within: Duration,

    /// Delay before a child is restarted
    #[serde(default = "default_restart_backoff", with = "duration_millis")]
    pub restart_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            within: default_within(),
            restart_backoff: default_restart_backoff(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_restarts == 0 {
            return Err(invalid("supervisor.max_restarts must be greater than 0"));
        }
        if self.within.is_zero() {
            return Err(invalid("supervisor.within must be greater than 0"));
        }
        Ok(())
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        if !["trace", "debug", "info", "warn", "error"].contains(&self.log_level.as_str()) {
            return Err(invalid(format!(
                "invalid observability.log_level: {}",
                self.log_level
            )));
        }
        Ok(())
    }
}

fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_group_id() -> String {
    "kafka-bridge".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_fetch_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_client_id() -> String {
    "kafka-bridge-producer".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_namespace() -> String {
    "kafka-bridge".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_commit_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_batch_size() -> usize {
    500
}

fn default_prefetch() -> usize {
    64
}

fn default_max_fetch_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_high_watermark() -> usize {
    16
}

fn default_low_watermark() -> usize {
    4
}

fn default_max_restarts() -> u32 {
    3
}

fn default_within() -> Duration {
    Duration::from_secs(60)
}

fn default_restart_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn valid_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.consumer.topics = vec!["events".to_string()];
        config
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.committer.backend, CommitterBackend::Kafka);
        assert_eq!(config.committer.merge_policy, MergePolicyKind::CallerWins);
        assert_eq!(config.commit_sink.commit_interval, Duration::from_secs(5));
        assert_eq!(config.sink.high_watermark, 16);
        assert_eq!(config.sink.low_watermark, 4);
    }

    #[test]
    fn test_validate_requires_topics() {
        assert!(BridgeConfig::default().validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_watermarks() {
        let mut config = valid_config();
        config.sink.low_watermark = 16;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.sink.low_watermark = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_namespace() {
        let mut config = valid_config();
        config.committer.namespace = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enum_serialization() {
        let json = serde_json::to_string(&CommitterBackend::Coordinated).unwrap();
        assert_eq!(json, "\"coordinated\"");

        let policy: MergePolicyKind = serde_json::from_str("\"highest_wins\"").unwrap();
        assert_eq!(policy, MergePolicyKind::HighestWins);
    }

    #[test]
    fn test_durations_as_millis() {
        let config = CommitSinkConfig {
            commit_interval: Duration::from_millis(1500),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"commit_interval":1500}"#);
    }

    #[test]
    fn test_load_yaml_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.yaml",
                r#"
consumer:
  group_id: orders
  topics: [orders]
committer:
  backend: coordinated
  lock_timeout: 250
"#,
            )?;
            jail.set_env("BRIDGE_COMMIT_SINK__COMMIT_INTERVAL", "100");

            let config = BridgeConfig::load(Some("bridge.yaml".into())).unwrap();
            assert_eq!(config.consumer.group_id, "orders");
            assert_eq!(config.consumer.topics, vec!["orders".to_string()]);
            assert_eq!(config.committer.backend, CommitterBackend::Coordinated);
            assert_eq!(config.committer.lock_timeout, Duration::from_millis(250));
            assert_eq!(config.commit_sink.commit_interval, Duration::from_millis(100));
            assert!(config.validate().is_ok());
            Ok(())
        });
    }
}
