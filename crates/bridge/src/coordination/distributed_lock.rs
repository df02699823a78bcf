//! Distributed lock primitive shared by the coordination backends
//!
//! Locks are named resources with an ownership token and a TTL. A
//! [`LockGuard`] is returned on acquisition; release it with
//! [`LockGuard::release`]. A guard dropped without an explicit release
//! schedules a best-effort release on the current runtime, and the TTL bounds
//! how long an abandoned lock survives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// Lock ownership token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Create a new random lock token
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the token value
    pub fn value(&self) -> &str {
        &self.0
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for lock acquisition retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fixed polling interval
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay for retry attempt
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(32) as i32);

        Duration::from_millis(delay.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Guard for a held distributed lock
#[derive(Debug)]
pub struct LockGuard {
    resource: String,
    token: LockToken,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
    backend: Arc<dyn DistributedLock>,
    released: bool,
}

impl LockGuard {
    /// Create a new lock guard
    pub fn new(
        resource: String,
        token: LockToken,
        ttl: Duration,
        backend: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            resource,
            token,
            acquired_at: Utc::now(),
            ttl,
            backend,
            released: false,
        }
    }

    /// Get the locked resource name
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Get the lock token
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Get the acquisition timestamp
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Check if the lock has expired (based on TTL)
    pub fn is_expired(&self) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.acquired_at);
        elapsed.to_std().unwrap_or_default() >= self.ttl
    }

    /// Release the lock now and report the outcome
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.backend
            .release_internal(&self.resource, &self.token)
            .await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let backend = self.backend.clone();
        let resource = std::mem::take(&mut self.resource);
        let token = self.token.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    // Best effort; the TTL reclaims the lock otherwise
                    let _ = backend.release_internal(&resource, &token).await;
                });
            }
            Err(_) => {
                debug!(resource = %resource, "No runtime to release lock, relying on TTL");
            }
        }
    }
}

/// Distributed lock trait
#[async_trait]
pub trait DistributedLock: Send + Sync + std::fmt::Debug {
    /// Acquire a lock for the given resource
    ///
    /// Polls [`DistributedLock::try_acquire`] with backoff until the lock is
    /// obtained or `timeout` elapses.
    ///
    /// # Arguments
    ///
    /// * `resource` - Name of the resource to lock
    /// * `timeout` - Longest time to wait for the lock
    /// * `ttl` - Time-to-live for the lock once held
    ///
    /// # Returns
    ///
    /// * `Ok(LockGuard)` - Lock acquired
    /// * `Err(BridgeError::LockTimeout)` - Lock still held by someone else at the deadline
    /// * `Err(BridgeError)` - Backend error
    async fn acquire(&self, resource: &str, timeout: Duration, ttl: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        let retry = self.retry_config();
        let mut attempt = 0u32;

        loop {
            if let Some(guard) = self.try_acquire(resource, ttl).await? {
                debug!(resource = %resource, attempt = attempt, "Lock acquired");
                return Ok(guard);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(BridgeError::lock_timeout(resource, elapsed.as_millis() as u64));
            }

            let delay = retry.calculate_delay(attempt).min(timeout - elapsed);
            debug!(
                resource = %resource,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Lock held by another owner, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Try to acquire a lock without waiting
    ///
    /// # Returns
    ///
    /// * `Ok(Some(LockGuard))` - Lock acquired
    /// * `Ok(None)` - Lock already held by another owner
    /// * `Err(BridgeError)` - Backend error
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockGuard>>;

    /// Release by resource and token (used by guards)
    async fn release_internal(&self, resource: &str, token: &LockToken) -> Result<()>;

    /// Check if a resource is currently locked
    async fn is_locked(&self, resource: &str) -> Result<bool>;

    /// Backoff used while waiting in [`DistributedLock::acquire`]
    fn retry_config(&self) -> RetryConfig {
        RetryConfig::default()
    }
}

/// Lock that is always available.
///
/// Used where the backing store serializes writers itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLock;

#[async_trait]
impl DistributedLock for NoopLock {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        Ok(Some(LockGuard::new(
            resource.to_string(),
            LockToken::new(),
            ttl,
            Arc::new(NoopLock),
        )))
    }

    async fn release_internal(&self, _resource: &str, _token: &LockToken) -> Result<()> {
        Ok(())
    }

    async fn is_locked(&self, _resource: &str) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_token_creation() {
        let token1 = LockToken::new();
        let token2 = LockToken::new();

        assert_ne!(token1, token2);
        assert!(!token1.value().is_empty());
    }

    #[test]
    fn test_lock_token_display() {
        let token = LockToken::from_string("test-123".to_string());
        assert_eq!(format!("{}", token), "test-123");
    }

    #[test]
    fn test_retry_config_backoff() {
        let config = RetryConfig::default();
        assert_eq!(config.calculate_delay(0), Duration::from_millis(10));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(20));
        assert_eq!(config.calculate_delay(20), Duration::from_millis(500));

        let fixed = RetryConfig::fixed(Duration::from_millis(5));
        assert_eq!(fixed.calculate_delay(7), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_noop_lock_always_available() {
        let lock = NoopLock;
        let first = lock
            .acquire("r", Duration::from_millis(1), Duration::from_secs(1))
            .await
            .unwrap();
        let second = lock.try_acquire("r", Duration::from_secs(1)).await.unwrap();

        assert!(second.is_some());
        assert!(!lock.is_locked("r").await.unwrap());
        first.release().await.unwrap();
    }
}
