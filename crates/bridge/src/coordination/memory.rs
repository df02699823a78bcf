//! In-memory coordination service
//!
//! A process-local stand-in for the coordination service. Handles created
//! with [`InMemoryCoordinator::session`] share the same store but keep their
//! own connection state, which lets tests model several processes against a
//! single service. Connectivity loss and write failures can be injected.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::distributed_lock::{DistributedLock, LockGuard, LockToken, RetryConfig};
use super::CoordinationClient;
use crate::error::{BridgeError, Result};

const BACKEND: &str = "memory";

#[derive(Debug)]
struct Store {
    values: DashMap<String, Vec<u8>>,
    locks: DashMap<String, HeldLock>,
    available: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
    open_sessions: AtomicUsize,
}

#[derive(Debug, Clone)]
struct HeldLock {
    token: LockToken,
    expires_at: Instant,
}

/// In-memory [`CoordinationClient`] and [`DistributedLock`]
#[derive(Debug, Clone)]
pub struct InMemoryCoordinator {
    store: Arc<Store>,
    connected: Arc<AtomicBool>,
    retry: RetryConfig,
}

impl InMemoryCoordinator {
    /// Create a new, empty service and a session on it
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store {
                values: DashMap::new(),
                locks: DashMap::new(),
                available: AtomicBool::new(true),
                fail_writes: AtomicBool::new(false),
                writes: AtomicUsize::new(0),
                open_sessions: AtomicUsize::new(0),
            }),
            connected: Arc::new(AtomicBool::new(false)),
            retry: RetryConfig::fixed(Duration::from_millis(5)),
        }
    }

    /// Another, initially disconnected, session on the same store
    pub fn session(&self) -> Self {
        Self {
            store: self.store.clone(),
            connected: Arc::new(AtomicBool::new(false)),
            retry: self.retry.clone(),
        }
    }

    /// Simulate the service becoming (un)reachable
    pub fn set_available(&self, available: bool) {
        self.store.available.store(available, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with a storage error
    pub fn fail_writes(&self, fail: bool) {
        self.store.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes since creation
    pub fn write_count(&self) -> usize {
        self.store.writes.load(Ordering::SeqCst)
    }

    /// Sessions currently connected
    pub fn open_sessions(&self) -> usize {
        self.store.open_sessions.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if !self.store.available.load(Ordering::SeqCst) {
            return Err(BridgeError::connectivity(BACKEND, "service unavailable"));
        }
        if !self.is_connected() {
            return Err(BridgeError::connectivity(BACKEND, "session not connected"));
        }
        Ok(())
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinator {
    async fn connect(&self) -> Result<()> {
        if !self.store.available.load(Ordering::SeqCst) {
            return Err(BridgeError::connectivity(BACKEND, "service unavailable"));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.store.open_sessions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.store.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check()?;
        Ok(self.store.values.contains_key(path))
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.store.values.get(path).map(|v| v.value().clone()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check()?;
        if self.store.fail_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::storage_write(path, "injected write failure"));
        }
        self.store.values.insert(path.to_string(), data.to_vec());
        self.store.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lock_service(&self) -> Arc<dyn DistributedLock> {
        Arc::new(self.clone())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

#[async_trait]
impl DistributedLock for InMemoryCoordinator {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        self.check()?;

        let token = LockToken::new();
        let now = Instant::now();
        let held = HeldLock {
            token: token.clone(),
            expires_at: now + ttl,
        };

        let acquired = match self.store.locks.entry(resource.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at <= now {
                    debug!(resource = %resource, "Reclaiming expired lock");
                    entry.insert(held);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(held);
                true
            }
        };

        if !acquired {
            return Ok(None);
        }

        Ok(Some(LockGuard::new(
            resource.to_string(),
            token,
            ttl,
            Arc::new(self.clone()),
        )))
    }

    async fn release_internal(&self, resource: &str, token: &LockToken) -> Result<()> {
        match self
            .store
            .locks
            .remove_if(resource, |_, held| &held.token == token)
        {
            Some(_) => Ok(()),
            None => Err(BridgeError::lock(
                resource,
                "token mismatch or lock already released",
            )),
        }
    }

    async fn is_locked(&self, resource: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .store
            .locks
            .get(resource)
            .map(|held| held.expires_at > now)
            .unwrap_or(false))
    }

    fn retry_config(&self) -> RetryConfig {
        self.retry.clone()
    }
}
