//! Source and commit sink bound to one consumer

use bridge_config::BridgeConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{CommitSink, DemandSource, Signal, SourceHandle, Subscription};
use crate::broker::{BrokerConsumer, Envelope};
use crate::committer::OffsetCommitter;
use crate::error::{BridgeError, Result};
use crate::offsets::OffsetMap;

/// A [`DemandSource`] and the [`CommitSink`] that acknowledges its records.
///
/// Both sides refer to the same consumer group, so acknowledged offsets are
/// committed for the subscription that produced them.
#[derive(Debug)]
pub struct PublisherWithCommitSink {
    source: SourceHandle,
    commit_sink: CommitSink,
    committer: Arc<dyn OffsetCommitter>,
}

impl PublisherWithCommitSink {
    /// Start the committer, then the source and commit sink.
    ///
    /// Fails with a configuration error when `committer` belongs to another
    /// group than `consumer`.
    pub async fn start(
        consumer: Arc<dyn BrokerConsumer>,
        committer: Arc<dyn OffsetCommitter>,
        config: &BridgeConfig,
    ) -> Result<(Self, mpsc::Receiver<Signal<Envelope>>)> {
        if committer.group_id() != consumer.group_id() {
            return Err(BridgeError::Configuration(format!(
                "committer group {} does not match consumer group {}",
                committer.group_id(),
                consumer.group_id()
            )));
        }

        committer.start().await?;

        let commit_sink = CommitSink::spawn(committer.clone(), &config.commit_sink);
        let (source, records) = DemandSource::new(
            consumer.clone(),
            config.consumer.topics.clone(),
            config.source.clone(),
        )
        .with_fetch_timeout(config.consumer.fetch_timeout)
        .spawn();

        info!(
            group = %consumer.group_id(),
            topics = ?config.consumer.topics,
            "Publisher with commit sink started"
        );

        Ok((
            Self {
                source,
                commit_sink,
                committer,
            },
            records,
        ))
    }

    /// Demand handle for the record stream
    pub fn subscription(&self) -> &SourceHandle {
        &self.source
    }

    pub fn commit_sink(&self) -> &CommitSink {
        &self.commit_sink
    }

    pub fn committer(&self) -> &Arc<dyn OffsetCommitter> {
        &self.committer
    }

    /// Flush acknowledged offsets, cancel the source and stop the committer.
    ///
    /// Returns the offsets stored by the final flush.
    pub async fn shutdown(self) -> Result<OffsetMap> {
        let flushed = self.commit_sink.shutdown().await;

        self.source.cancel();
        self.source.terminated().await;

        if let Err(e) = self.committer.stop().await {
            warn!(group = %self.committer.group_id(), error = %e, "Failed to stop committer");
        }

        info!(group = %self.committer.group_id(), "Publisher with commit sink stopped");
        flushed
    }
}
