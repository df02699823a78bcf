//! Coordination service client and distributed locking
//!
//! The coordinated offset committer stores offsets in a hierarchical
//! key-value store and guards every read-modify-write with per-partition
//! locks taken from the same service.
//!
//! # Features
//!
//! - **CoordinationClient**: connect/close, exists, read and create-or-update writes
//! - **DistributedLock**: token-checked locks with TTL and bounded acquisition
//! - **PartitionLock**: lock scoped to (topic, group, partition)
//! - **Scoped acquisition**: [`with_partition_locks`] releases on every exit path
//! - **Backends**: Redis ([`RedisCoordinator`]) and in-memory ([`InMemoryCoordinator`])
//!
//! # Key layout
//!
//! ```text
//! {namespace}/offsets/{group}/{topic}/{partition}   decimal next-read offset
//! {namespace}/locks/{topic}/{group}/{partition}     lock token
//! ```
//!
//! Every segment is escaped so that a `/` inside a group or topic name cannot
//! collide with another key.

mod distributed_lock;
mod memory;
mod partition_lock;
mod redis_coordinator;

pub use distributed_lock::{DistributedLock, LockGuard, LockToken, NoopLock, RetryConfig};
pub use memory::InMemoryCoordinator;
pub use partition_lock::{with_partition_locks, PartitionLock};
pub use redis_coordinator::RedisCoordinator;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::offsets::TopicPartition;

/// Client for a hierarchical key-value coordination service
#[async_trait]
pub trait CoordinationClient: Send + Sync + std::fmt::Debug {
    /// Open the session; a no-op when already connected
    async fn connect(&self) -> Result<()>;

    /// Close the session; a no-op when already closed
    async fn close(&self) -> Result<()>;

    /// Round-trip to the service
    async fn ping(&self) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read the value at `path`, `None` if absent
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Write `data` at `path`, creating the entry if absent
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Lock primitive backed by this service
    fn lock_service(&self) -> Arc<dyn DistributedLock>;

    /// Backend name for logs and errors
    fn backend_name(&self) -> &'static str;
}

/// Path of the stored next-read offset for (group, topic, partition)
pub fn offset_path(namespace: &str, group: &str, partition: &TopicPartition) -> String {
    format!(
        "{}/offsets/{}/{}/{}",
        escape_segment(namespace),
        escape_segment(group),
        escape_segment(&partition.topic),
        partition.partition
    )
}

/// Lock resource for (topic, group, partition)
pub fn lock_path(namespace: &str, group: &str, partition: &TopicPartition) -> String {
    format!(
        "{}/locks/{}/{}/{}",
        escape_segment(namespace),
        escape_segment(&partition.topic),
        escape_segment(group),
        partition.partition
    )
}

fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}
