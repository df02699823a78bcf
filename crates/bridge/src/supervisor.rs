//! Restart supervision for adapter tasks
//!
//! [`supervise`] runs a child built by a factory and decides what happens
//! when it ends:
//!
//! - success or cancellation ends supervision
//! - a fatal error (closed producer, bad configuration) escalates at once
//! - any other error restarts the child after a backoff, unless more than
//!   `max_restarts` failures fall inside the sliding `within` window, in
//!   which case the failure escalates
//!
//! Escalations are logged with `error!` exactly once and returned as
//! [`BridgeError::Escalated`].

use bridge_config::SupervisorConfig;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{BridgeError, Result};

/// When to restart a failed child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub within: Duration,
    pub backoff: Duration,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            within: config.within,
            backoff: config.restart_backoff,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

/// Failure timestamps inside the sliding window
#[derive(Debug)]
struct RestartWindow {
    within: Duration,
    failures: VecDeque<Instant>,
}

impl RestartWindow {
    fn new(within: Duration) -> Self {
        Self {
            within,
            failures: VecDeque::new(),
        }
    }

    /// Record a failure at `now`; returns failures still inside the window
    fn record(&mut self, now: Instant) -> usize {
        self.failures.push_back(now);
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > self.within {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len()
    }
}

/// Run `factory`'s child until it succeeds, is cancelled, or escalates
pub async fn supervise<F, Fut>(name: &str, policy: &RestartPolicy, mut factory: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut window = RestartWindow::new(policy.within);
    let mut restarts: u32 = 0;

    loop {
        let error = match factory().await {
            Ok(()) => {
                info!(child = name, restarts, "Child finished");
                return Ok(());
            }
            Err(BridgeError::Cancelled) => {
                info!(child = name, restarts, "Child cancelled");
                return Ok(());
            }
            Err(e) => e,
        };

        if error.is_fatal() {
            error!(
                child = name,
                error = %error,
                severity = %error.severity(),
                "Fatal child failure, escalating"
            );
            return Err(BridgeError::escalated(name, error));
        }

        let failures = window.record(Instant::now());
        if failures > policy.max_restarts as usize {
            error!(
                child = name,
                failures,
                within_ms = policy.within.as_millis() as u64,
                error = %error,
                "Restart budget exhausted, escalating"
            );
            return Err(BridgeError::escalated(name, error));
        }

        restarts += 1;
        warn!(
            child = name,
            restart = restarts,
            failures_in_window = failures,
            backoff_ms = policy.backoff.as_millis() as u64,
            error = %error,
            "Child failed, restarting"
        );
        tokio::time::sleep(policy.backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_restarts: u32, within_secs: u64, backoff_secs: u64) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            within: Duration::from_secs(within_secs),
            backoff: Duration::from_secs(backoff_secs),
        }
    }

    type Child = std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>>;

    /// Child failing with `error` for its first `failures` runs
    fn flaky(calls: Arc<AtomicU32>, failures: u32, error: fn() -> BridgeError) -> impl FnMut() -> Child {
        move || -> Child {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(error())
                } else {
                    Ok(())
                }
            })
        }
    }

    fn transient() -> BridgeError {
        BridgeError::connectivity("kafka", "broker down")
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        supervise("source", &policy(3, 60, 1), flaky(calls.clone(), 2, transient))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_escalates() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = supervise("source", &policy(2, 60, 1), flaky(calls.clone(), u32::MAX, transient))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Escalated { .. }));
        assert!(err.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_escalates_without_restart() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = supervise(
            "sink",
            &policy(5, 60, 1),
            flaky(calls.clone(), u32::MAX, || BridgeError::producer_closed("out")),
        )
        .await
        .unwrap_err();

        match err {
            BridgeError::Escalated { child, source } => {
                assert_eq!(child, "sink");
                assert!(matches!(*source, BridgeError::ProducerClosed { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_forgotten() {
        let calls = Arc::new(AtomicU32::new(0));
        supervise("source", &policy(1, 5, 10), flaky(calls.clone(), 4, transient))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_supervision() {
        let calls = Arc::new(AtomicU32::new(0));
        supervise("source", &policy(3, 60, 1), flaky(calls.clone(), u32::MAX, || BridgeError::Cancelled))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_from_config() {
        let config = SupervisorConfig::default();
        let policy = RestartPolicy::from(&config);
        assert_eq!(policy.max_restarts, config.max_restarts);
        assert_eq!(policy.backoff, config.restart_backoff);
    }
}
