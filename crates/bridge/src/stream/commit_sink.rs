//! Acknowledged-offset accumulator
//!
//! Acknowledgments are queued to the sink task without waiting, so the
//! processing path never blocks on commit I/O. The task folds them into a
//! pending [`OffsetMap`] and flushes it to the [`OffsetCommitter`] on a fixed
//! interval, on [`CommitSink::commit_now`], and on shutdown. Entries stay
//! pending until a flush containing them succeeds.

use bridge_config::CommitSinkConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::Envelope;
use crate::committer::OffsetCommitter;
use crate::error::{BridgeError, Result};
use crate::offsets::{OffsetMap, TopicPartition};

/// Commit sink counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitSinkStats {
    pub acks_received: u64,
    /// Acks at or below an already pending or committed offset
    pub stale_acks: u64,
    pub flushes: u64,
    pub successful_flushes: u64,
    pub failed_flushes: u64,
    /// Partition entries written across all successful flushes
    pub offsets_committed: u64,
    pub last_commit_time: Option<DateTime<Utc>>,
}

enum Command {
    Ack(TopicPartition, i64),
    CommitNow(oneshot::Sender<Result<OffsetMap>>),
    Pending(oneshot::Sender<OffsetMap>),
    Shutdown(oneshot::Sender<Result<OffsetMap>>),
}

/// Handle on a running commit sink. Clones share the same task.
#[derive(Debug, Clone)]
pub struct CommitSink {
    group_id: String,
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<RwLock<CommitSinkStats>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Ack(partition, offset) => write!(f, "Ack({}, {})", partition, offset),
            Command::CommitNow(_) => write!(f, "CommitNow"),
            Command::Pending(_) => write!(f, "Pending"),
            Command::Shutdown(_) => write!(f, "Shutdown"),
        }
    }
}

impl CommitSink {
    /// Start a sink flushing into `committer` every `commit_interval`
    pub fn spawn(committer: Arc<dyn OffsetCommitter>, config: &CommitSinkConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(CommitSinkStats::default()));
        let group_id = committer.group_id().to_string();

        let actor = CommitSinkActor {
            committer,
            commands: rx,
            interval: config.commit_interval,
            pending: OffsetMap::new(),
            committed: OffsetMap::new(),
            stats: stats.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            group_id,
            commands: tx,
            stats,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Acknowledge a processed record
    pub fn ack(&self, envelope: &Envelope) -> Result<()> {
        self.ack_offset(envelope.topic_partition(), envelope.offset)
    }

    /// Acknowledge `offset` as the last processed offset of `partition`.
    ///
    /// Negative offsets and `i64::MAX` (which has no next offset to commit)
    /// are rejected.
    pub fn ack_offset(&self, partition: TopicPartition, offset: i64) -> Result<()> {
        if offset < 0 || offset == i64::MAX {
            return Err(BridgeError::InvalidOffset {
                partition: partition.to_string(),
                offset,
            });
        }
        self.commands
            .send(Command::Ack(partition, offset))
            .map_err(|_| BridgeError::Cancelled)
    }

    /// Flush pending offsets now and return what the committer stored
    pub async fn commit_now(&self) -> Result<OffsetMap> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::CommitNow(tx))
            .map_err(|_| BridgeError::Cancelled)?;
        rx.await.map_err(|_| BridgeError::Cancelled)?
    }

    /// Offsets acknowledged but not yet committed
    pub async fn pending(&self) -> Result<OffsetMap> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Pending(tx))
            .map_err(|_| BridgeError::Cancelled)?;
        rx.await.map_err(|_| BridgeError::Cancelled)
    }

    pub async fn stats(&self) -> CommitSinkStats {
        self.stats.read().await.clone()
    }

    /// Flush once more and stop the task.
    ///
    /// Calls after the sink has stopped return an empty map.
    pub async fn shutdown(&self) -> Result<OffsetMap> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_err() {
            return Ok(OffsetMap::new());
        }
        rx.await.unwrap_or_else(|_| Ok(OffsetMap::new()))
    }
}

struct CommitSinkActor {
    committer: Arc<dyn OffsetCommitter>,
    commands: mpsc::UnboundedReceiver<Command>,
    interval: Duration,
    pending: OffsetMap,
    /// Last-consumed offsets known to be stored
    committed: OffsetMap,
    stats: Arc<RwLock<CommitSinkStats>>,
}

impl CommitSinkActor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            group = %self.committer.group_id(),
            interval_ms = self.interval.as_millis() as u64,
            "Commit sink started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Ack(partition, offset)) => self.ack(partition, offset).await,
                    Some(Command::CommitNow(reply)) => {
                        let result = self.flush().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Pending(reply)) => {
                        let _ = reply.send(self.pending.clone());
                    }
                    Some(Command::Shutdown(reply)) => {
                        let result = self.flush().await;
                        let _ = reply.send(result);
                        break;
                    }
                    None => {
                        let _ = self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        let _ = self.flush().await;
                    }
                }
            }
        }

        info!(
            group = %self.committer.group_id(),
            unflushed = self.pending.len(),
            "Commit sink stopped"
        );
    }

    async fn ack(&mut self, partition: TopicPartition, offset: i64) {
        let mut stats = self.stats.write().await;
        stats.acks_received += 1;

        if offset <= self.committed.last_offset(&partition)
            || offset <= self.pending.last_offset(&partition)
        {
            stats.stale_acks += 1;
            debug!(partition = %partition, offset, "Ignoring stale acknowledgment");
            return;
        }

        self.pending = self.pending.plus_offset(partition, offset);
    }

    async fn flush(&mut self) -> Result<OffsetMap> {
        if self.pending.is_empty() {
            return Ok(OffsetMap::new());
        }

        let snapshot = self.pending.clone();
        self.stats.write().await.flushes += 1;

        match self.committer.commit(&snapshot).await {
            Ok(stored) => {
                self.pending = self.pending.diff(&snapshot);
                self.committed = self.committed.union(&snapshot);

                let mut stats = self.stats.write().await;
                stats.successful_flushes += 1;
                stats.offsets_committed += snapshot.len() as u64;
                stats.last_commit_time = Some(Utc::now());

                debug!(
                    group = %self.committer.group_id(),
                    partitions = snapshot.len(),
                    "Flushed offsets"
                );
                Ok(stored)
            }
            Err(e) => {
                self.stats.write().await.failed_flushes += 1;
                warn!(
                    group = %self.committer.group_id(),
                    partitions = snapshot.len(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "Offset flush failed, keeping offsets for the next attempt"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::committer::KafkaCommitter;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("t", partition)
    }

    async fn setup(interval: Duration) -> (InMemoryBroker, CommitSink) {
        let broker = InMemoryBroker::new();
        broker.create_topic("t", 2);
        let committer = KafkaCommitter::new(Arc::new(broker.consumer("g")), Duration::from_secs(1));
        committer.start().await.unwrap();

        let sink = CommitSink::spawn(
            Arc::new(committer),
            &CommitSinkConfig {
                commit_interval: interval,
            },
        );
        (broker, sink)
    }

    #[tokio::test]
    async fn test_commit_now_stores_next_offset() {
        let (broker, sink) = setup(Duration::from_secs(3600)).await;

        for offset in 0..3 {
            sink.ack_offset(tp(0), offset).unwrap();
        }
        sink.ack_offset(tp(1), 7).unwrap();

        let stored = sink.commit_now().await.unwrap();
        assert_eq!(stored.get(&tp(0)), Some(3));
        assert_eq!(stored.get(&tp(1)), Some(8));
        assert_eq!(broker.committed_offset("g", &tp(0)), Some(3));
        assert!(sink.pending().await.unwrap().is_empty());

        let stats = sink.stats().await;
        assert_eq!(stats.acks_received, 4);
        assert_eq!(stats.successful_flushes, 1);
        assert_eq!(stats.offsets_committed, 2);
        assert!(stats.last_commit_time.is_some());

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["successful_flushes"], 1);
        assert_eq!(json["acks_received"], 4);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_pending() {
        let (broker, sink) = setup(Duration::from_secs(3600)).await;
        sink.ack_offset(tp(0), 4).unwrap();

        broker.fail_next_commits(1);
        assert!(sink.commit_now().await.is_err());
        assert_eq!(sink.pending().await.unwrap().get(&tp(0)), Some(4));
        assert_eq!(broker.committed_offset("g", &tp(0)), None);

        sink.commit_now().await.unwrap();
        assert_eq!(broker.committed_offset("g", &tp(0)), Some(5));

        let stats = sink.stats().await;
        assert_eq!(stats.failed_flushes, 1);
        assert_eq!(stats.successful_flushes, 1);
    }

    #[tokio::test]
    async fn test_stale_acks_ignored() {
        let (broker, sink) = setup(Duration::from_secs(3600)).await;

        sink.ack_offset(tp(0), 6).unwrap();
        sink.ack_offset(tp(0), 4).unwrap();
        assert_eq!(sink.pending().await.unwrap().get(&tp(0)), Some(6));

        sink.commit_now().await.unwrap();
        sink.ack_offset(tp(0), 5).unwrap();
        assert!(sink.pending().await.unwrap().is_empty());
        assert_eq!(broker.committed_offset("g", &tp(0)), Some(7));
        assert_eq!(sink.stats().await.stale_acks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let (broker, sink) = setup(Duration::from_secs(5)).await;
        sink.ack_offset(tp(1), 2).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.committed_offset("g", &tp(1)), None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(broker.committed_offset("g", &tp(1)), Some(3));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_stops() {
        let (broker, sink) = setup(Duration::from_secs(3600)).await;
        sink.ack_offset(tp(0), 9).unwrap();

        let stored = sink.shutdown().await.unwrap();
        assert_eq!(stored.get(&tp(0)), Some(10));
        assert_eq!(broker.committed_offset("g", &tp(0)), Some(10));

        assert!(sink.shutdown().await.unwrap().is_empty());
        assert!(matches!(sink.ack_offset(tp(0), 10), Err(BridgeError::Cancelled)));
        assert!(matches!(sink.commit_now().await, Err(BridgeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_negative_offset_rejected() {
        let (_broker, sink) = setup(Duration::from_secs(3600)).await;
        let err = sink.ack_offset(tp(0), -1).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOffset { offset: -1, .. }));
    }

    #[tokio::test]
    async fn test_max_offset_rejected_and_sink_survives() {
        let (broker, sink) = setup(Duration::from_secs(3600)).await;

        let err = sink.ack_offset(tp(0), i64::MAX).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOffset { offset: i64::MAX, .. }));

        sink.ack_offset(tp(0), i64::MAX - 1).unwrap();
        let stored = sink.commit_now().await.unwrap();
        assert_eq!(stored.get(&tp(0)), Some(i64::MAX));
        assert_eq!(broker.committed_offset("g", &tp(0)), Some(i64::MAX));

        sink.ack_offset(tp(1), 0).unwrap();
        assert_eq!(sink.commit_now().await.unwrap().get(&tp(1)), Some(1));
    }
}
