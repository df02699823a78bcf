use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::OffsetCommitter;
use crate::broker::BrokerConsumer;
use crate::coordination::PartitionLock;
use crate::error::{BridgeError, Result};
use crate::offsets::{OffsetMap, TopicPartition};

/// Commits through the broker's own offset storage.
///
/// The consumer handle belongs to the source that fetched the records; this
/// committer only borrows it and never closes it.
pub struct KafkaCommitter {
    consumer: Arc<dyn BrokerConsumer>,
    connect_timeout: Duration,
    started: AtomicBool,
}

impl std::fmt::Debug for KafkaCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaCommitter")
            .field("group_id", &self.consumer.group_id())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl KafkaCommitter {
    pub fn new(consumer: Arc<dyn BrokerConsumer>, connect_timeout: Duration) -> Self {
        Self {
            consumer,
            connect_timeout,
            started: AtomicBool::new(false),
        }
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(BridgeError::connectivity("kafka", "committer not started"));
        }
        Ok(())
    }
}

#[async_trait]
impl OffsetCommitter for KafkaCommitter {
    fn group_id(&self) -> &str {
        self.consumer.group_id()
    }

    async fn start(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.consumer.is_closed() {
            return Err(BridgeError::connectivity("kafka", "consumer is closed"));
        }

        tokio::time::timeout(self.connect_timeout, self.consumer.committed(&[]))
            .await
            .map_err(|_| {
                BridgeError::connectivity(
                    "kafka",
                    format!("broker unreachable within {:?}", self.connect_timeout),
                )
            })??;

        self.started.store(true, Ordering::SeqCst);
        info!(group = %self.group_id(), "Kafka committer started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.started.swap(false, Ordering::SeqCst) {
            info!(group = %self.group_id(), "Kafka committer stopped");
        }
        Ok(())
    }

    fn partition_lock(&self, partition: &TopicPartition) -> PartitionLock {
        PartitionLock::noop(partition.clone(), self.group_id())
    }

    async fn commit(&self, offsets: &OffsetMap) -> Result<OffsetMap> {
        self.ensure_started()?;
        if offsets.is_empty() {
            return Ok(OffsetMap::new());
        }

        let request = offsets.to_commit_request();
        self.consumer.commit(&request).await?;

        let stored = self.consumer.committed(&offsets.partitions()).await?;
        debug!(
            group = %self.group_id(),
            partitions = stored.len(),
            "Committed offsets via broker"
        );
        Ok(stored)
    }

    async fn fetch(&self, partitions: &[TopicPartition]) -> Result<OffsetMap> {
        self.ensure_started()?;
        self.consumer.committed(partitions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("t", partition)
    }

    #[tokio::test]
    async fn test_commit_returns_next_read_offsets() {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 2);
        let committer = KafkaCommitter::new(Arc::new(broker.consumer("g")), Duration::from_secs(1));
        committer.start().await.unwrap();
        committer.start().await.unwrap();

        let offsets: OffsetMap = vec![(tp(0), 4), (tp(1), 0)].into_iter().collect();
        let stored = committer.commit(&offsets).await.unwrap();

        assert_eq!(stored, offsets.shifted(1));
        assert_eq!(committer.fetch(&[tp(0), tp(1)]).await.unwrap(), stored);
        assert_eq!(broker.committed_offset("g", &tp(0)), Some(5));
    }

    #[tokio::test]
    async fn test_requires_start() {
        let broker = InMemoryBroker::new();
        let committer = KafkaCommitter::new(Arc::new(broker.consumer("g")), Duration::from_secs(1));

        let err = committer
            .commit(&OffsetMap::new().plus_offset(tp(0), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connectivity { .. }));

        committer.start().await.unwrap();
        committer.stop().await.unwrap();
        committer.stop().await.unwrap();
        assert!(committer.fetch(&[tp(0)]).await.is_err());
    }

    #[tokio::test]
    async fn test_partition_lock_is_noop() {
        let broker = InMemoryBroker::new();
        let committer = KafkaCommitter::new(Arc::new(broker.consumer("g")), Duration::from_secs(1));

        let lock = committer.partition_lock(&tp(0));
        let _a = lock.acquire().await.unwrap();
        let b = lock.try_acquire().await.unwrap();
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces() {
        let broker = InMemoryBroker::new();
        let committer = KafkaCommitter::new(Arc::new(broker.consumer("g")), Duration::from_secs(1));
        committer.start().await.unwrap();

        broker.fail_next_commits(1);
        let err = committer
            .commit(&OffsetMap::new().plus_offset(tp(0), 1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(broker.committed_offset("g", &tp(0)), None);
    }
}
