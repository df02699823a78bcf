use async_trait::async_trait;
use bridge_config::CommitterConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::OffsetCommitter;
use crate::coordination::{
    lock_path, offset_path, with_partition_locks, CoordinationClient, DistributedLock,
    PartitionLock, RetryConfig,
};
use crate::error::{BridgeError, Result};
use crate::offsets::{merge, merge_policy, MergePolicy, OffsetMap, TopicPartition};

/// Commits into a coordination service under per-partition locks.
///
/// A commit:
/// 1. takes one lock per partition, in partition order
/// 2. reads the stored next-read offsets for exactly those partitions
/// 3. merges the proposed offsets over them with the configured policy
/// 4. writes only entries whose value changed
/// 5. re-reads and returns what is stored
///
/// Locks are released before returning on every path.
pub struct CoordinatedCommitter<C: CoordinationClient> {
    client: C,
    locks: Arc<dyn DistributedLock>,
    group_id: String,
    namespace: String,
    connect_timeout: Duration,
    lock_timeout: Duration,
    lock_ttl: Duration,
    policy: Arc<dyn MergePolicy>,
    retry: RetryConfig,
    started: Mutex<bool>,
}

impl<C: CoordinationClient> std::fmt::Debug for CoordinatedCommitter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatedCommitter")
            .field("backend", &self.client.backend_name())
            .field("group_id", &self.group_id)
            .field("namespace", &self.namespace)
            .field("policy", &self.policy.name())
            .finish()
    }
}

impl<C: CoordinationClient> CoordinatedCommitter<C> {
    pub fn new(client: C, group_id: impl Into<String>, config: &CommitterConfig) -> Self {
        let locks = client.lock_service();
        Self {
            client,
            locks,
            group_id: group_id.into(),
            namespace: config.namespace.clone(),
            connect_timeout: config.connect_timeout,
            lock_timeout: config.lock_timeout,
            lock_ttl: config.lock_ttl,
            policy: merge_policy(config.merge_policy),
            retry: RetryConfig::default(),
            started: Mutex::new(false),
        }
    }

    /// Replace the configured merge policy
    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// The coordination client
    pub fn client(&self) -> &C {
        &self.client
    }

    async fn ensure_started(&self) -> Result<()> {
        if !*self.started.lock().await {
            return Err(BridgeError::connectivity(
                self.client.backend_name(),
                "committer not started",
            ));
        }
        Ok(())
    }

    async fn read_offsets(&self, partitions: &[TopicPartition]) -> Result<OffsetMap> {
        let mut stored = OffsetMap::new();
        for partition in partitions {
            let path = offset_path(&self.namespace, &self.group_id, partition);
            if let Some(bytes) = self.client.read(&path).await? {
                stored = stored.checked_plus_offset(partition.clone(), parse_offset(partition, &bytes)?)?;
            }
        }
        Ok(stored)
    }

    async fn locked_commit(&self, offsets: &OffsetMap, partitions: &[TopicPartition]) -> Result<OffsetMap> {
        let stored = self.read_offsets(partitions).await?;

        // Stored values are next-read; merge in last-consumed terms
        let merged = merge(&stored.shifted(-1), offsets, self.policy.as_ref());
        let target = merged.shifted(1);
        let changed = target.diff(&stored);

        for (partition, offset) in changed.iter() {
            let path = offset_path(&self.namespace, &self.group_id, partition);
            self.client
                .write(&path, offset.to_string().as_bytes())
                .await
                .map_err(|e| match e {
                    BridgeError::StorageWrite { message, .. } => {
                        BridgeError::storage_write(path.clone(), message)
                    }
                    other => other,
                })?;
        }

        let confirmed = self.read_offsets(partitions).await?;
        if confirmed != target {
            return Err(BridgeError::storage_write(
                format!("{}/offsets/{}", self.namespace, self.group_id),
                "stored offsets differ from written offsets",
            ));
        }

        debug!(
            group = %self.group_id,
            partitions = partitions.len(),
            written = changed.len(),
            policy = self.policy.name(),
            "Committed offsets"
        );
        Ok(confirmed)
    }
}

fn parse_offset(partition: &TopicPartition, bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| BridgeError::InvalidOffset {
            partition: partition.to_string(),
            offset: crate::offsets::UNKNOWN_OFFSET,
        })
}

#[async_trait]
impl<C: CoordinationClient + 'static> OffsetCommitter for CoordinatedCommitter<C> {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn start(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }

        let deadline = Instant::now() + self.connect_timeout;
        let mut attempt = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match tokio::time::timeout(remaining, self.client.connect()).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::connectivity(
                    self.client.backend_name(),
                    "connect attempt timed out",
                )),
            };

            match outcome {
                Ok(()) => break,
                Err(e) if Instant::now() >= deadline => {
                    return Err(BridgeError::connectivity(
                        self.client.backend_name(),
                        format!(
                            "unreachable after {} attempts within {:?}: {}",
                            attempt + 1,
                            self.connect_timeout,
                            e
                        ),
                    ));
                }
                Err(e) => {
                    let delay = self
                        .retry
                        .calculate_delay(attempt)
                        .min(deadline.saturating_duration_since(Instant::now()));
                    warn!(
                        backend = self.client.backend_name(),
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Coordination service unreachable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }

        *started = true;
        info!(
            backend = self.client.backend_name(),
            group = %self.group_id,
            "Coordinated committer started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if !*started {
            return Ok(());
        }
        *started = false;
        self.client.close().await?;
        info!(group = %self.group_id, "Coordinated committer stopped");
        Ok(())
    }

    fn partition_lock(&self, partition: &TopicPartition) -> PartitionLock {
        PartitionLock::new(
            partition.clone(),
            self.group_id.clone(),
            lock_path(&self.namespace, &self.group_id, partition),
            self.lock_timeout,
            self.lock_ttl,
            self.locks.clone(),
        )
    }

    async fn commit(&self, offsets: &OffsetMap) -> Result<OffsetMap> {
        self.ensure_started().await?;
        if offsets.is_empty() {
            return Ok(OffsetMap::new());
        }

        let partitions = offsets.partitions();
        let locks = partitions.iter().map(|p| self.partition_lock(p)).collect();

        with_partition_locks(locks, || self.locked_commit(offsets, &partitions)).await
    }

    async fn fetch(&self, partitions: &[TopicPartition]) -> Result<OffsetMap> {
        self.ensure_started().await?;
        self.read_offsets(partitions).await
    }
}
