//! Offset committers
//!
//! An [`OffsetCommitter`] durably stores consumption progress. Callers hand
//! in last-consumed offsets; stored and returned offsets are next-to-read
//! (one greater).
//!
//! # Features
//!
//! - **Broker-native**: [`KafkaCommitter`] delegates to the consumer's own
//!   offset storage, the broker serializes commits per group
//! - **Coordinated**: [`CoordinatedCommitter`] keeps one key per
//!   (group, topic, partition) in a coordination service and guards each
//!   read-modify-write with partition locks taken in sorted order
//! - **Configuration-selected**: [`build_committer`]

mod coordinated;
mod kafka;

pub use coordinated::CoordinatedCommitter;
pub use kafka::KafkaCommitter;

use async_trait::async_trait;
use bridge_config::{CommitterBackend, CommitterConfig};
use std::sync::Arc;

use crate::broker::BrokerConsumer;
use crate::coordination::{PartitionLock, RedisCoordinator};
use crate::error::Result;
use crate::offsets::{OffsetMap, TopicPartition};

/// Durable store for per-partition consumption progress
#[async_trait]
pub trait OffsetCommitter: Send + Sync + std::fmt::Debug {
    /// Consumer group the offsets belong to
    fn group_id(&self) -> &str;

    /// Reach the backing store. Idempotent; fails with a connectivity error
    /// if the store stays unreachable for the configured bounded wait.
    async fn start(&self) -> Result<()>;

    /// Release the backing store connection. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Lock covering `partition` for this committer's group
    fn partition_lock(&self, partition: &TopicPartition) -> PartitionLock;

    /// Persist last-consumed `offsets` and return the stored next-to-read
    /// offsets for the same partitions.
    ///
    /// Either every requested partition is stored or an error is returned
    /// and the caller retries.
    async fn commit(&self, offsets: &OffsetMap) -> Result<OffsetMap>;

    /// Stored next-to-read offsets; partitions without one are absent
    async fn fetch(&self, partitions: &[TopicPartition]) -> Result<OffsetMap>;
}

/// Build the configured committer for `consumer`'s group
pub fn build_committer(
    config: &CommitterConfig,
    consumer: Arc<dyn BrokerConsumer>,
) -> Result<Arc<dyn OffsetCommitter>> {
    match config.backend {
        CommitterBackend::Kafka => Ok(Arc::new(KafkaCommitter::new(
            consumer,
            config.connect_timeout,
        ))),
        CommitterBackend::Coordinated => {
            let client = RedisCoordinator::new(&config.redis_url)?;
            Ok(Arc::new(CoordinatedCommitter::new(
                client,
                consumer.group_id(),
                config,
            )))
        }
    }
}
