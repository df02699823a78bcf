//! Demand-driven Kafka adapters with pluggable offset commit
//!
//! This crate connects a Kafka consumer and producer to demand-driven
//! pipelines and commits acknowledged progress through one of two offset
//! committers.
//!
//! # Features
//!
//! - **Offsets**: immutable [`OffsetMap`] values with merge policies
//! - **Committers**: broker-native or coordination-service backed, the latter
//!   guarded by per-partition distributed locks
//! - **Stream adapters**: [`DemandSource`], [`DemandSink`], [`CommitSink`]
//! - **Supervision**: bounded restarts with escalation of fatal failures
//!
//! # Example
//!
//! ```rust,no_run
//! use kafka_bridge::{
//!     build_committer, BridgeConfig, KafkaConsumer, PublisherWithCommitSink, Signal,
//!     Subscription,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> kafka_bridge::Result<()> {
//! let config = BridgeConfig::load(None)?;
//! let consumer = Arc::new(KafkaConsumer::new(&config.consumer)?);
//! let committer = build_committer(&config.committer, consumer.clone())?;
//!
//! let (pair, mut records) = PublisherWithCommitSink::start(consumer, committer, &config).await?;
//! pair.subscription().request(100);
//! while let Some(Signal::Next(envelope)) = records.recv().await {
//!     pair.commit_sink().ack(&envelope)?;
//! }
//! pair.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod committer;
pub mod coordination;
pub mod error;
pub mod offsets;
pub mod stream;
pub mod supervisor;
pub mod telemetry;

pub use bridge_config::{self, BridgeConfig};

pub use broker::{
    BrokerConsumer, BrokerProducer, DeliveryReport, Envelope, InMemoryBroker, KafkaConsumer,
    KafkaProducer, ProducerRecord,
};
pub use committer::{build_committer, CoordinatedCommitter, KafkaCommitter, OffsetCommitter};
pub use coordination::{
    CoordinationClient, DistributedLock, InMemoryCoordinator, PartitionLock, RedisCoordinator,
};
pub use error::{BridgeError, ErrorSeverity, Result};
pub use offsets::{CommitRequest, MergePolicy, OffsetMap, TopicPartition, UNKNOWN_OFFSET};
pub use stream::{
    CommitSink, DemandSink, DemandSource, PublisherWithCommitSink, Signal, Subscription,
    WatermarkRequestStrategy,
};
pub use supervisor::{supervise, RestartPolicy};
pub use telemetry::init_tracing;
