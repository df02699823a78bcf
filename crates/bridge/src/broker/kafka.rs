//! rdkafka-backed consumer and producer handles

use async_trait::async_trait;
use bridge_config::{ConsumerConfig, ProducerConfig};
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{BrokerConsumer, BrokerProducer, DeliveryReport, Envelope, ProducerRecord};
use crate::error::{BridgeError, Result};
use crate::offsets::{CommitRequest, OffsetMap, TopicPartition};

/// How long to keep draining once the first record of a batch has arrived
const DRAIN_LINGER: Duration = Duration::from_millis(5);

/// Timeout for committed-offset lookups
const COMMITTED_TIMEOUT: Duration = Duration::from_secs(10);

/// Logs rebalances and commit outcomes
struct BridgeConsumerContext {
    group_id: String,
}

impl ClientContext for BridgeConsumerContext {}

impl ConsumerContext for BridgeConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(group = %self.group_id, partitions = tpl.count(), "Partition revocation");
            }
            Rebalance::Assign(tpl) => {
                info!(group = %self.group_id, partitions = tpl.count(), "Partition assignment");
            }
            Rebalance::Error(err) => {
                error!(group = %self.group_id, error = %err, "Rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(group = %self.group_id, partitions = offsets.count(), "Offsets committed"),
            Err(err) => warn!(group = %self.group_id, error = %err, "Commit callback error"),
        }
    }
}

/// Consumer handle over an rdkafka [`StreamConsumer`]
pub struct KafkaConsumer {
    consumer: RwLock<Option<Arc<StreamConsumer<BridgeConsumerContext>>>>,
    group_id: String,
    closed: AtomicBool,
}

impl std::fmt::Debug for KafkaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumer")
            .field("group_id", &self.group_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl KafkaConsumer {
    /// Create a consumer with auto-commit disabled
    pub fn new(config: &ConsumerConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset);

        for (key, value) in &config.additional_properties {
            client_config.set(key, value);
        }

        let context = BridgeConsumerContext {
            group_id: config.group_id.clone(),
        };
        let consumer: StreamConsumer<BridgeConsumerContext> = client_config
            .create_with_context(context)
            .map_err(BridgeError::from)?;

        info!(group = %config.group_id, "Created Kafka consumer");

        Ok(Self {
            consumer: RwLock::new(Some(Arc::new(consumer))),
            group_id: config.group_id.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn handle(&self) -> Result<Arc<StreamConsumer<BridgeConsumerContext>>> {
        self.consumer
            .read()
            .await
            .clone()
            .ok_or_else(|| BridgeError::consumption("consumer is closed"))
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let consumer = self.handle().await?;
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!(group = %self.group_id, topics = ?topics, "Subscribed");
        Ok(())
    }

    async fn fetch(&self, max_records: usize, timeout: Duration) -> Result<Vec<Envelope>> {
        let consumer = self.handle().await?;
        let mut batch = Vec::with_capacity(max_records.min(1024));
        let mut deadline = tokio::time::Instant::now() + timeout;

        while batch.len() < max_records {
            match tokio::time::timeout_at(deadline, consumer.recv()).await {
                Ok(Ok(msg)) => {
                    batch.push(Envelope {
                        topic: msg.topic().to_string(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        key: msg.key().map(<[u8]>::to_vec),
                        value: msg.payload().map(<[u8]>::to_vec),
                        timestamp: msg
                            .timestamp()
                            .to_millis()
                            .and_then(DateTime::<Utc>::from_timestamp_millis),
                    });
                    let linger = tokio::time::Instant::now() + DRAIN_LINGER;
                    deadline = deadline.min(linger);
                }
                Ok(Err(KafkaError::PartitionEOF(partition))) => {
                    debug!(group = %self.group_id, partition = partition, "Reached end of partition");
                    break;
                }
                Ok(Err(e)) if batch.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    warn!(group = %self.group_id, error = %e, "Fetch error after partial batch");
                    break;
                }
                Err(_elapsed) => break,
            }
        }

        Ok(batch)
    }

    async fn commit(&self, request: &CommitRequest) -> Result<()> {
        let consumer = self.handle().await?;
        let metadata = request.metadata();

        let mut tpl = TopicPartitionList::with_capacity(request.len());
        for (partition, offset) in request.iter() {
            let mut elem = tpl.add_partition(&partition.topic, partition.partition);
            elem.set_offset(Offset::Offset(*offset))?;
            elem.set_metadata(&metadata);
        }

        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| BridgeError::storage_write("kafka", format!("commit task failed: {}", e)))??;

        debug!(
            group = %self.group_id,
            partitions = request.len(),
            formed_at = %metadata,
            "Committed offsets to broker"
        );
        Ok(())
    }

    async fn committed(&self, partitions: &[TopicPartition]) -> Result<OffsetMap> {
        let consumer = self.handle().await?;

        let mut tpl = TopicPartitionList::with_capacity(partitions.len());
        for partition in partitions {
            tpl.add_partition(&partition.topic, partition.partition);
        }

        let result = tokio::task::spawn_blocking(move || {
            consumer.committed_offsets(tpl, Timeout::After(COMMITTED_TIMEOUT))
        })
        .await
        .map_err(|e| BridgeError::consumption(format!("offset lookup task failed: {}", e)))??;

        Ok(result
            .elements()
            .iter()
            .filter_map(|elem| match elem.offset() {
                Offset::Offset(offset) => {
                    Some((TopicPartition::new(elem.topic(), elem.partition()), offset))
                }
                _ => None,
            })
            .collect())
    }

    async fn close(&self) -> Result<bool> {
        let taken = self.consumer.write().await.take();
        self.closed.store(true, Ordering::SeqCst);

        match taken {
            Some(consumer) => {
                consumer.unsubscribe();
                info!(group = %self.group_id, "Kafka consumer closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Producer handle over an rdkafka [`FutureProducer`]
pub struct KafkaProducer {
    producer: RwLock<Option<FutureProducer>>,
    send_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProducer")
            .field("send_timeout", &self.send_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl KafkaProducer {
    pub fn new(config: &ProducerConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("client.id", &config.client_id)
            .set("acks", &config.acks)
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string());

        for (key, value) in &config.additional_properties {
            client_config.set(key, value);
        }

        let producer: FutureProducer = client_config.create().map_err(BridgeError::from)?;
        info!(client_id = %config.client_id, "Created Kafka producer");

        Ok(Self {
            producer: RwLock::new(Some(producer)),
            send_timeout: config.send_timeout,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReport> {
        let producer = self
            .producer
            .read()
            .await
            .clone()
            .ok_or_else(|| BridgeError::producer_closed(&record.topic))?;

        let mut future_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&record.topic);
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        if let Some(value) = record.value.as_deref() {
            future_record = future_record.payload(value);
        }

        match producer
            .send(future_record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(DeliveryReport { partition, offset }),
            Err((e, _message)) => {
                if self.is_closed() {
                    Err(BridgeError::producer_closed(&record.topic))
                } else {
                    Err(BridgeError::send(&record.topic, e.to_string()))
                }
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let Some(producer) = self.producer.read().await.clone() else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BridgeError::send("*", format!("flush task failed: {}", e)))??;
        Ok(())
    }

    async fn close(&self) -> Result<bool> {
        let taken = self.producer.write().await.take();
        self.closed.store(true, Ordering::SeqCst);

        let Some(producer) = taken else {
            return Ok(false);
        };

        let timeout = self.send_timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BridgeError::send("*", format!("flush task failed: {}", e)))?;
        if let Err(e) = flushed {
            warn!(error = %e, "Flush on close failed");
        }

        info!("Kafka producer closed");
        Ok(true)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_config() -> ConsumerConfig {
        ConsumerConfig {
            topics: vec!["bridge-test".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_consumer_close_idempotent() {
        // Client creation does not contact the broker
        let consumer = KafkaConsumer::new(&consumer_config()).unwrap();
        assert!(!consumer.is_closed());

        assert!(consumer.close().await.unwrap());
        assert!(!consumer.close().await.unwrap());
        assert!(consumer.is_closed());
        assert!(consumer.fetch(1, Duration::from_millis(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let producer = KafkaProducer::new(&ProducerConfig {
            send_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap();

        assert!(producer.close().await.unwrap());
        assert!(!producer.close().await.unwrap());

        let err = producer
            .send(ProducerRecord::new("bridge-test").with_value("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ProducerClosed { .. }));
    }

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_round_trip_against_broker() {
        let producer = KafkaProducer::new(&ProducerConfig::default()).unwrap();
        let report = producer
            .send(ProducerRecord::new("bridge-test").with_key("k").with_value("v"))
            .await
            .unwrap();
        assert!(report.offset >= 0);

        let consumer = KafkaConsumer::new(&consumer_config()).unwrap();
        consumer.subscribe(&["bridge-test".to_string()]).await.unwrap();
        let batch = consumer.fetch(10, Duration::from_secs(10)).await.unwrap();
        assert!(!batch.is_empty());

        let map: OffsetMap = batch
            .iter()
            .map(|e| (e.topic_partition(), e.offset))
            .collect();
        consumer.commit(&map.to_commit_request()).await.unwrap();
        let committed = consumer.committed(&map.partitions()).await.unwrap();
        assert_eq!(committed, map.shifted(1));
    }
}
