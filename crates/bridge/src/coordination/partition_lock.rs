use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::distributed_lock::{DistributedLock, LockGuard, NoopLock};
use crate::error::Result;
use crate::offsets::TopicPartition;

/// Exclusive ownership of one (topic, group, partition) critical section.
#[derive(Debug, Clone)]
pub struct PartitionLock {
    partition: TopicPartition,
    group: String,
    resource: String,
    timeout: Duration,
    ttl: Duration,
    backend: Arc<dyn DistributedLock>,
}

impl PartitionLock {
    pub fn new(
        partition: TopicPartition,
        group: impl Into<String>,
        resource: String,
        timeout: Duration,
        ttl: Duration,
        backend: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            partition,
            group: group.into(),
            resource,
            timeout,
            ttl,
            backend,
        }
    }

    /// A lock that never blocks, for backends that serialize commits themselves
    pub fn noop(partition: TopicPartition, group: impl Into<String>) -> Self {
        let group = group.into();
        let resource = format!("{}/{}/{}", partition.topic, group, partition.partition);
        Self::new(
            partition,
            group,
            resource,
            Duration::ZERO,
            Duration::ZERO,
            Arc::new(NoopLock),
        )
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Backend resource name
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Acquire, waiting up to the configured lock timeout
    pub async fn acquire(&self) -> Result<LockGuard> {
        self.backend
            .acquire(&self.resource, self.timeout, self.ttl)
            .await
    }

    /// Acquire only if free right now
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        self.backend.try_acquire(&self.resource, self.ttl).await
    }

    pub async fn is_locked(&self) -> Result<bool> {
        self.backend.is_locked(&self.resource).await
    }

    /// Run `f` while holding this lock
    pub async fn scoped<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_partition_locks(vec![self.clone()], f).await
    }
}

/// Run `f` while holding every lock in `locks`.
///
/// Locks are taken one at a time in partition order, so two callers with
/// overlapping sets cannot deadlock. All acquired locks are released before
/// returning, whether `f` succeeds or fails or acquisition itself fails
/// part-way. If `f` panics the guards are dropped and release in the
/// background.
pub async fn with_partition_locks<F, Fut, T>(mut locks: Vec<PartitionLock>, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    locks.sort_by(|a, b| a.partition.cmp(&b.partition));
    locks.dedup_by(|a, b| a.partition == b.partition);

    let mut guards = Vec::with_capacity(locks.len());
    for lock in &locks {
        match lock.acquire().await {
            Ok(guard) => guards.push(guard),
            Err(e) => {
                debug!(
                    partition = %lock.partition,
                    group = %lock.group,
                    error = %e,
                    "Partition lock not acquired, releasing held locks"
                );
                release_all(guards).await;
                return Err(e);
            }
        }
    }

    let result = f().await;
    release_all(guards).await;
    result
}

async fn release_all(guards: Vec<LockGuard>) {
    for guard in guards.into_iter().rev() {
        let resource = guard.resource().to_string();
        if let Err(e) = guard.release().await {
            warn!(resource = %resource, error = %e, "Failed to release partition lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationClient, InMemoryCoordinator};
    use crate::error::BridgeError;

    fn lock_for(coordinator: &InMemoryCoordinator, partition: i32) -> PartitionLock {
        PartitionLock::new(
            TopicPartition::new("t", partition),
            "g",
            format!("locks/t/g/{}", partition),
            Duration::from_millis(50),
            Duration::from_secs(30),
            coordinator.lock_service(),
        )
    }

    #[tokio::test]
    async fn test_scoped_release_on_error() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.connect().await.unwrap();
        let lock = lock_for(&coordinator, 0);

        let result: Result<()> = lock
            .scoped(|| async { Err(BridgeError::storage_write("k", "boom")) })
            .await;

        assert!(matches!(result, Err(BridgeError::StorageWrite { .. })));
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_held_while_running() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.connect().await.unwrap();
        let locks = vec![lock_for(&coordinator, 1), lock_for(&coordinator, 0)];
        let probe = locks.clone();

        let held = with_partition_locks(locks, || async {
            let mut held = Vec::new();
            for lock in &probe {
                held.push(lock.is_locked().await?);
            }
            Ok::<_, BridgeError>(held)
        })
        .await
        .unwrap();

        assert_eq!(held, vec![true, true]);
        for lock in &probe {
            assert!(!lock.is_locked().await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_partial_acquisition_released() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.connect().await.unwrap();

        let blocker = lock_for(&coordinator, 1).acquire().await.unwrap();

        let result = with_partition_locks(
            vec![lock_for(&coordinator, 0), lock_for(&coordinator, 1)],
            || async { Ok(()) },
        )
        .await;

        assert!(matches!(result, Err(BridgeError::LockTimeout { .. })));
        assert!(!lock_for(&coordinator, 0).is_locked().await.unwrap());
        blocker.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_partition_lock() {
        let lock = PartitionLock::noop(TopicPartition::new("t", 3), "g");
        assert_eq!(lock.resource(), "t/g/3");
        let value = lock.scoped(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
