//! In-memory broker
//!
//! Topics hold a fixed number of append-only partitions. Consumers start
//! each partition at their group's committed offset (or 0) and commit into a
//! per-group table, so a fresh consumer of the same group resumes where the
//! last commit left off. Producers route records to an explicit partition,
//! else by key hash, else to partition 0.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::debug;

use super::{BrokerConsumer, BrokerProducer, DeliveryReport, Envelope, ProducerRecord};
use crate::error::{BridgeError, Result};
use crate::offsets::{CommitRequest, OffsetMap, TopicPartition};

#[derive(Debug, Default)]
struct BrokerState {
    /// topic -> partitions -> records
    topics: DashMap<String, Vec<Vec<Envelope>>>,
    /// (group, partition) -> next offset to read
    committed: DashMap<(String, TopicPartition), i64>,
    /// Records appended
    appended: Notify,
    failing_fetches: AtomicUsize,
    failing_commits: AtomicUsize,
}

/// Shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `topic` with `partitions` partitions; no-op if it exists
    pub fn create_topic(&self, topic: impl Into<String>, partitions: usize) {
        self.state
            .topics
            .entry(topic.into())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state.topics.get(topic).map(|t| t.len())
    }

    /// Append a record and return its offset
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> Result<i64> {
        let offset = {
            let mut partitions = self
                .state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BridgeError::send(topic, "unknown topic"))?;
            let log = usize::try_from(partition)
                .ok()
                .and_then(|p| partitions.get_mut(p))
                .ok_or_else(|| BridgeError::send(topic, format!("unknown partition {}", partition)))?;

            let offset = log.len() as i64;
            log.push(Envelope {
                topic: topic.to_string(),
                partition,
                offset,
                key,
                value,
                timestamp: Some(Utc::now()),
            });
            offset
        };

        self.state.appended.notify_waiters();
        Ok(offset)
    }

    /// Every record in one partition
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Envelope> {
        self.state
            .topics
            .get(topic)
            .and_then(|t| usize::try_from(partition).ok().and_then(|p| t.get(p).cloned()))
            .unwrap_or_default()
    }

    /// Committed next-to-read offset for a group
    pub fn committed_offset(&self, group: &str, partition: &TopicPartition) -> Option<i64> {
        self.state
            .committed
            .get(&(group.to_string(), partition.clone()))
            .map(|o| *o)
    }

    /// Fail the next `n` fetches with a connectivity error
    pub fn fail_next_fetches(&self, n: usize) {
        self.state.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commits with a storage error
    pub fn fail_next_commits(&self, n: usize) {
        self.state.failing_commits.store(n, Ordering::SeqCst);
    }

    /// New consumer handle for `group`
    pub fn consumer(&self, group: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            group_id: group.into(),
            subscriptions: RwLock::new(Vec::new()),
            positions: DashMap::new(),
            fetch_requests: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// New producer handle
    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            times_closed: Arc::new(AtomicUsize::new(0)),
            send_delay: Duration::ZERO,
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Consumer handle on an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group_id: String,
    subscriptions: RwLock<Vec<String>>,
    positions: DashMap<TopicPartition, i64>,
    fetch_requests: Mutex<Vec<usize>>,
    closed: AtomicBool,
}

impl InMemoryConsumer {
    /// `max_records` of every fetch so far
    pub async fn fetch_requests(&self) -> Vec<usize> {
        self.fetch_requests.lock().await.clone()
    }

    async fn drain_available(&self, max_records: usize) -> Vec<Envelope> {
        let topics = self.subscriptions.read().await.clone();
        let mut batch = Vec::new();

        for topic in topics {
            let Some(partitions) = self.broker.state.topics.get(&topic).map(|t| t.clone()) else {
                continue;
            };

            for (index, log) in partitions.iter().enumerate() {
                if batch.len() >= max_records {
                    return batch;
                }
                let tp = TopicPartition::new(topic.clone(), index as i32);
                let start = match self.positions.get(&tp) {
                    Some(position) => *position,
                    None => self
                        .broker
                        .committed_offset(&self.group_id, &tp)
                        .unwrap_or(0),
                };

                let take = max_records - batch.len();
                let records: Vec<Envelope> = log
                    .iter()
                    .skip(usize::try_from(start).unwrap_or(0))
                    .take(take)
                    .cloned()
                    .collect();

                let next = start + records.len() as i64;
                self.positions.insert(tp, next);
                batch.extend(records);
            }
        }

        batch
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        for topic in topics {
            if !subscriptions.contains(topic) {
                subscriptions.push(topic.clone());
            }
        }
        Ok(())
    }

    async fn fetch(&self, max_records: usize, timeout: Duration) -> Result<Vec<Envelope>> {
        if self.is_closed() {
            return Err(BridgeError::consumption("consumer is closed"));
        }
        self.fetch_requests.lock().await.push(max_records);

        if InMemoryBroker::take_failure(&self.broker.state.failing_fetches) {
            return Err(BridgeError::connectivity("memory-broker", "injected fetch failure"));
        }

        let appended = self.broker.state.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        let batch = self.drain_available(max_records).await;
        if !batch.is_empty() {
            return Ok(batch);
        }

        if tokio::time::timeout(timeout, appended).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.drain_available(max_records).await)
    }

    async fn commit(&self, request: &CommitRequest) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::consumption("consumer is closed"));
        }
        if InMemoryBroker::take_failure(&self.broker.state.failing_commits) {
            return Err(BridgeError::storage_write(
                "memory-broker",
                "injected commit failure",
            ));
        }

        for (partition, offset) in request.iter() {
            self.broker
                .state
                .committed
                .insert((self.group_id.clone(), partition.clone()), *offset);
        }
        debug!(group = %self.group_id, partitions = request.len(), "Committed offsets");
        Ok(())
    }

    async fn committed(&self, partitions: &[TopicPartition]) -> Result<OffsetMap> {
        if self.is_closed() {
            return Err(BridgeError::consumption("consumer is closed"));
        }
        Ok(partitions
            .iter()
            .filter_map(|p| {
                self.broker
                    .committed_offset(&self.group_id, p)
                    .map(|o| (p.clone(), o))
            })
            .collect())
    }

    async fn close(&self) -> Result<bool> {
        Ok(!self.closed.swap(true, Ordering::SeqCst))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Producer handle on an [`InMemoryBroker`].
///
/// Clones share the same open/closed state, so a test can close the handle
/// from outside the adapter that owns it.
#[derive(Debug, Clone)]
pub struct InMemoryProducer {
    broker: InMemoryBroker,
    closed: Arc<AtomicBool>,
    times_closed: Arc<AtomicUsize>,
    send_delay: Duration,
}

impl InMemoryProducer {
    /// Delay every send, keeping records in flight
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Number of calls that actually closed the handle
    pub fn times_closed(&self) -> usize {
        self.times_closed.load(Ordering::SeqCst)
    }

    fn route(&self, record: &ProducerRecord) -> Result<i32> {
        if let Some(partition) = record.partition {
            return Ok(partition);
        }
        let count = self
            .broker
            .partition_count(&record.topic)
            .ok_or_else(|| BridgeError::send(&record.topic, "unknown topic"))?;

        Ok(match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as i32
            }
            None => 0,
        })
    }
}

#[async_trait]
impl BrokerProducer for InMemoryProducer {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReport> {
        if self.is_closed() {
            return Err(BridgeError::producer_closed(&record.topic));
        }
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
            if self.is_closed() {
                return Err(BridgeError::producer_closed(&record.topic));
            }
        }

        let partition = self.route(&record)?;
        let offset = self
            .broker
            .append(&record.topic, partition, record.key, record.value)?;
        Ok(DeliveryReport { partition, offset })
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<bool> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.times_closed.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with(topic: &str, partitions: usize) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_topic(topic, partitions);
        broker
    }

    #[tokio::test]
    async fn test_fetch_respects_max_and_order() {
        let broker = broker_with("t", 1);
        for i in 0..5u8 {
            broker.append("t", 0, None, Some(vec![i])).unwrap();
        }

        let consumer = broker.consumer("g");
        consumer.subscribe(&["t".to_string()]).await.unwrap();

        let first = consumer.fetch(2, Duration::from_millis(10)).await.unwrap();
        let second = consumer.fetch(10, Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<i64> = first.iter().chain(&second).map(|e| e.offset).collect();

        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert_eq!(consumer.fetch_requests().await, vec![2, 10]);
    }

    #[tokio::test]
    async fn test_fetch_times_out_empty() {
        let broker = broker_with("t", 1);
        let consumer = broker.consumer("g");
        consumer.subscribe(&["t".to_string()]).await.unwrap();

        let batch = consumer.fetch(5, Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_append() {
        let broker = broker_with("t", 1);
        let consumer = broker.consumer("g");
        consumer.subscribe(&["t".to_string()]).await.unwrap();

        let writer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("t", 0, None, Some(b"late".to_vec())).unwrap();
        });

        let batch = consumer.fetch(5, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_new_consumer_resumes_from_commit() {
        let broker = broker_with("t", 1);
        for _ in 0..4 {
            broker.append("t", 0, None, None).unwrap();
        }
        let tp = TopicPartition::new("t", 0);

        let first = broker.consumer("g");
        first.subscribe(&["t".to_string()]).await.unwrap();
        first.fetch(10, Duration::from_millis(10)).await.unwrap();
        let request = OffsetMap::new().plus_offset(tp.clone(), 1).to_commit_request();
        first.commit(&request).await.unwrap();
        assert_eq!(broker.committed_offset("g", &tp), Some(2));

        let second = broker.consumer("g");
        second.subscribe(&["t".to_string()]).await.unwrap();
        let batch = second.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.first().map(|e| e.offset), Some(2));

        let other_group = broker.consumer("h");
        assert!(other_group.committed(&[tp]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_producer_routing() {
        let broker = broker_with("t", 4);
        let producer = broker.producer();

        let explicit = producer
            .send(ProducerRecord::new("t").with_partition(3))
            .await
            .unwrap();
        assert_eq!(explicit.partition, 3);

        let unkeyed = producer.send(ProducerRecord::new("t")).await.unwrap();
        assert_eq!(unkeyed.partition, 0);

        let a = producer.send(ProducerRecord::new("t").with_key("k")).await.unwrap();
        let b = producer.send(ProducerRecord::new("t").with_key("k")).await.unwrap();
        assert_eq!(a.partition, b.partition);

        let missing = producer.send(ProducerRecord::new("nope")).await;
        assert!(matches!(missing, Err(BridgeError::Send { .. })));
    }

    #[tokio::test]
    async fn test_producer_close_counted_once() {
        let broker = broker_with("t", 1);
        let producer = broker.producer();
        let external = producer.clone();

        assert!(external.close().await.unwrap());
        assert!(!producer.close().await.unwrap());
        assert_eq!(producer.times_closed(), 1);

        let err = producer.send(ProducerRecord::new("t")).await.unwrap_err();
        assert!(matches!(err, BridgeError::ProducerClosed { .. }));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = broker_with("t", 1);
        let consumer = broker.consumer("g");
        consumer.subscribe(&["t".to_string()]).await.unwrap();

        broker.fail_next_fetches(1);
        let err = consumer.fetch(1, Duration::from_millis(1)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(consumer.fetch(1, Duration::from_millis(1)).await.is_ok());

        broker.fail_next_commits(1);
        let request = OffsetMap::new()
            .plus_offset(TopicPartition::new("t", 0), 0)
            .to_commit_request();
        assert!(consumer.commit(&request).await.is_err());
        assert!(consumer.commit(&request).await.is_ok());
    }
}
