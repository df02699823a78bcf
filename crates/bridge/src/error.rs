//! Error types for the bridge runtime.
//!
//! Errors fall into two groups:
//! - transient failures (connectivity loss, a failed offset write, a lock
//!   timeout) that the next commit tick or a supervised restart retries
//! - fatal failures (a closed producer, bad configuration, an escalated child)
//!   that terminate the affected adapter and are reported upward

use std::fmt;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error type shared by every bridge component.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Backing store (broker or coordination service) is unreachable.
    #[error("{backend} unreachable: {message}")]
    Connectivity {
        /// Which backend failed ("kafka", "redis", ...).
        backend: String,
        message: String,
    },

    /// An offset write failed after the partition lock was taken.
    #[error("Failed to write offset at {key}: {message}")]
    StorageWrite { key: String, message: String },

    /// A partition lock could not be acquired within the bounded wait.
    #[error("Timed out after {waited_ms}ms waiting for lock {resource}")]
    LockTimeout { resource: String, waited_ms: u64 },

    /// The producer handle was closed before or during a send.
    #[error("Producer for topic {topic} is closed")]
    ProducerClosed { topic: String },

    /// A single record could not be delivered.
    #[error("Failed to send record to topic {topic}: {message}")]
    Send { topic: String, message: String },

    /// A broker fetch failed.
    #[error("Failed to consume messages: {message}")]
    Consumption { message: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// An offset outside the valid range was supplied.
    #[error("Invalid offset {offset} for partition {partition}")]
    InvalidOffset { partition: String, offset: i64 },

    /// The operation was cancelled by its owner.
    #[error("Operation cancelled")]
    Cancelled,

    /// A supervised child failed beyond its restart budget.
    #[error("Child {child} escalated: {source}")]
    Escalated {
        child: String,
        #[source]
        source: Box<BridgeError>,
    },

    /// Lock protocol failure other than a timeout.
    #[error("Lock error on {resource}: {message}")]
    Lock { resource: String, message: String },
}

impl BridgeError {
    /// Create a connectivity error.
    pub fn connectivity(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a storage write error.
    pub fn storage_write(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageWrite {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a lock timeout error.
    pub fn lock_timeout(resource: impl Into<String>, waited_ms: u64) -> Self {
        Self::LockTimeout {
            resource: resource.into(),
            waited_ms,
        }
    }

    /// Create a producer closed error.
    pub fn producer_closed(topic: impl Into<String>) -> Self {
        Self::ProducerClosed {
            topic: topic.into(),
        }
    }

    /// Create a send error.
    pub fn send(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Send {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a consumption error.
    pub fn consumption(message: impl Into<String>) -> Self {
        Self::Consumption {
            message: message.into(),
        }
    }

    /// Create a lock error.
    pub fn lock(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lock {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Wrap a child failure for escalation to the owner.
    pub fn escalated(child: impl Into<String>, source: BridgeError) -> Self {
        Self::Escalated {
            child: child.into(),
            source: Box::new(source),
        }
    }

    /// Check if the error is retryable.
    ///
    /// Retryable errors leave no partial state behind; the caller may repeat
    /// the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Connectivity { .. }
                | BridgeError::StorageWrite { .. }
                | BridgeError::LockTimeout { .. }
        )
    }

    /// Check if the error is fatal to the component that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ProducerClosed { .. }
                | BridgeError::Configuration(_)
                | BridgeError::Escalated { .. }
        )
    }

    /// Get error severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BridgeError::Configuration(_) | BridgeError::Escalated { .. } => {
                ErrorSeverity::Critical
            }
            BridgeError::ProducerClosed { .. }
            | BridgeError::Send { .. }
            | BridgeError::Connectivity { .. }
            | BridgeError::InvalidOffset { .. }
            | BridgeError::Lock { .. } => ErrorSeverity::Error,
            BridgeError::StorageWrite { .. }
            | BridgeError::LockTimeout { .. }
            | BridgeError::Consumption { .. } => ErrorSeverity::Warning,
            BridgeError::Cancelled => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<bridge_config::ConfigError> for BridgeError {
    fn from(err: bridge_config::ConfigError) -> Self {
        BridgeError::Configuration(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for BridgeError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError as RdKafkaError;
        use rdkafka::types::RDKafkaErrorCode;

        match err {
            RdKafkaError::ClientCreation(msg) => BridgeError::connectivity("kafka", msg),

            RdKafkaError::Global(
                code @ (RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::OperationTimedOut),
            ) => BridgeError::connectivity("kafka", code.to_string()),

            RdKafkaError::MessageProduction(code) => {
                BridgeError::send("unknown", format!("production failed: {}", code))
            }

            RdKafkaError::ConsumerCommit(code)
            | RdKafkaError::StoreOffset(code)
            | RdKafkaError::OffsetFetch(code) => {
                BridgeError::storage_write("kafka", code.to_string())
            }

            RdKafkaError::Canceled => BridgeError::Cancelled,

            other => BridgeError::consumption(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for BridgeError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            BridgeError::connectivity("redis", err.to_string())
        } else {
            BridgeError::storage_write("redis", err.to_string())
        }
    }
}
