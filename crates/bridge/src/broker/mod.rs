//! Broker client collaborators
//!
//! The bridge talks to the broker through two narrow traits. The consumer
//! side is pull-based: callers ask for at most N records and get back
//! whatever arrived within the fetch timeout. The producer side sends one
//! record at a time and reports per-record delivery.
//!
//! # Features
//!
//! - **Kafka**: [`KafkaConsumer`] / [`KafkaProducer`] over rdkafka
//! - **In-memory**: [`InMemoryBroker`] with topics, partitions and
//!   per-group committed offsets, used by tests and local runs

mod kafka;
mod memory;

pub use kafka::{KafkaConsumer, KafkaProducer};
pub use memory::{InMemoryBroker, InMemoryConsumer, InMemoryProducer};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::offsets::{CommitRequest, OffsetMap, TopicPartition};

/// A fetched broker record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A record to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition; otherwise chosen by the producer
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: None,
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Where a sent record landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
}

/// Pull-based consumer handle
#[async_trait]
pub trait BrokerConsumer: Send + Sync + std::fmt::Debug {
    /// Consumer group this handle commits for
    fn group_id(&self) -> &str;

    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Fetch at most `max_records`, waiting up to `timeout` for the first one.
    ///
    /// An empty batch means nothing arrived in time.
    async fn fetch(&self, max_records: usize, timeout: Duration) -> Result<Vec<Envelope>>;

    /// Commit next-to-read offsets to the broker's offset storage
    async fn commit(&self, request: &CommitRequest) -> Result<()>;

    /// Committed next-to-read offsets; partitions without one are absent
    async fn committed(&self, partitions: &[TopicPartition]) -> Result<OffsetMap>;

    /// Close the handle. Returns `true` only for the call that closed it.
    async fn close(&self) -> Result<bool>;

    fn is_closed(&self) -> bool;
}

/// Asynchronous producer handle
#[async_trait]
pub trait BrokerProducer: Send + Sync + std::fmt::Debug {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReport>;

    async fn flush(&self, timeout: Duration) -> Result<()>;

    /// Close the handle. Returns `true` only for the call that closed it.
    async fn close(&self) -> Result<bool>;

    fn is_closed(&self) -> bool;
}
