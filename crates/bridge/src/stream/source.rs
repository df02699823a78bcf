//! Broker consumer exposed as a demand-driven publisher
//!
//! The source task moves between four states:
//!
//! ```text
//! Idle --request--> AwaitingFetch --batch--> Delivering --demand exhausted--> Idle
//!   \____________________ cancel (any state) ____________________> Cancelled
//! ```
//!
//! A fetch asks the broker for at most `demand + prefetch - buffered` records,
//! capped at `max_batch_size` but never fewer than one, and elements are emitted one at a time, never
//! more than the outstanding demand. The broker stream is unbounded so the
//! source never completes on its own; cancellation (or dropping the receiver)
//! ends it and closes the consumer.

use bridge_config::SourceConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use super::{Demand, Signal, Subscription};
use crate::broker::{BrokerConsumer, Envelope};
use crate::error::BridgeError;

const SIGNAL_BUFFER: usize = 16;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle state of a [`DemandSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceState {
    Idle,
    AwaitingFetch,
    Delivering,
    Cancelled,
}

/// Source counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceMetrics {
    /// Total demand received from downstream
    pub requested: u64,
    /// Elements emitted downstream
    pub emitted: u64,
    /// Broker fetches issued
    pub fetches: u64,
    /// Failed fetches, retried or not
    pub fetch_errors: u64,
    /// Largest `max_records` ever passed to a fetch
    pub largest_fetch_request: usize,
}

enum Command {
    Request(u64),
    Cancel,
}

/// Downstream handle on a running [`DemandSource`]
#[derive(Debug, Clone)]
pub struct SourceHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancelled: Arc<AtomicBool>,
    state: watch::Receiver<SourceState>,
    metrics: Arc<RwLock<SourceMetrics>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Request(n) => write!(f, "Request({})", n),
            Command::Cancel => write!(f, "Cancel"),
        }
    }
}

impl SourceHandle {
    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    pub async fn metrics(&self) -> SourceMetrics {
        self.metrics.read().await.clone()
    }

    /// Wait until the source has stopped and closed its consumer
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SourceState::Cancelled).await;
    }
}

impl Subscription for SourceHandle {
    fn request(&self, n: u64) {
        let _ = self.commands.send(Command::Request(n));
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Cancel);
        }
    }
}

/// Builder for a broker-backed publisher
pub struct DemandSource {
    consumer: Arc<dyn BrokerConsumer>,
    topics: Vec<String>,
    config: SourceConfig,
    fetch_timeout: Duration,
}

impl DemandSource {
    pub fn new(consumer: Arc<dyn BrokerConsumer>, topics: Vec<String>, config: SourceConfig) -> Self {
        Self {
            consumer,
            topics,
            config,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// Upper bound on a single broker fetch
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Start the source task
    pub fn spawn(self) -> (SourceHandle, mpsc::Receiver<Signal<Envelope>>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (state_tx, state_rx) = watch::channel(SourceState::Idle);
        let cancelled = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(RwLock::new(SourceMetrics::default()));

        let actor = SourceActor {
            consumer: self.consumer,
            topics: self.topics,
            config: self.config,
            fetch_timeout: self.fetch_timeout,
            commands: command_rx,
            out: signal_tx,
            state: state_tx,
            cancelled: cancelled.clone(),
            metrics: metrics.clone(),
            demand: Demand::default(),
            buffer: VecDeque::new(),
            retries: 0,
        };
        tokio::spawn(actor.run());

        let handle = SourceHandle {
            commands: command_tx,
            cancelled,
            state: state_rx,
            metrics,
        };
        (handle, signal_rx)
    }
}

enum Step {
    Continue,
    Stop,
    Fail(BridgeError),
}

struct SourceActor {
    consumer: Arc<dyn BrokerConsumer>,
    topics: Vec<String>,
    config: SourceConfig,
    fetch_timeout: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    out: mpsc::Sender<Signal<Envelope>>,
    state: watch::Sender<SourceState>,
    cancelled: Arc<AtomicBool>,
    metrics: Arc<RwLock<SourceMetrics>>,
    demand: Demand,
    buffer: VecDeque<Envelope>,
    retries: u32,
}

impl SourceActor {
    async fn run(mut self) {
        info!(group = %self.consumer.group_id(), topics = ?self.topics, "Source started");

        let subscribe = {
            let consumer = self.consumer.clone();
            let topics = self.topics.clone();
            async move { consumer.subscribe(&topics).await }
        };
        let mut step = match self.until_cancelled(subscribe).await {
            Some(Ok(())) => Step::Continue,
            Some(Err(e)) => Step::Fail(e),
            None => Step::Stop,
        };

        while let Step::Continue = step {
            step = if self.demand.is_zero() {
                self.await_demand().await
            } else if self.buffer.is_empty() {
                self.fetch().await
            } else {
                self.deliver_one().await
            };
        }

        if let Step::Fail(e) = step {
            self.emit_error(e).await;
        }
        self.teardown().await;
    }

    /// Apply one command; false means stop
    async fn handle_command(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Request(0)) => {
                warn!(group = %self.consumer.group_id(), "Ignoring request for zero elements");
                true
            }
            Some(Command::Request(n)) => {
                self.demand.add(n);
                self.metrics.write().await.requested += n;
                true
            }
            Some(Command::Cancel) | None => false,
        }
    }

    /// Drive `fut` while still serving commands; `None` if cancelled first
    async fn until_cancelled<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if !self.handle_command(command).await {
                        return None;
                    }
                }
                output = &mut fut => return Some(output),
            }
        }
    }

    async fn await_demand(&mut self) -> Step {
        if self.buffer.is_empty() {
            self.state.send_replace(SourceState::Idle);
        }

        tokio::select! {
            command = self.commands.recv() => {
                if self.handle_command(command).await {
                    Step::Continue
                } else {
                    Step::Stop
                }
            }
            _ = self.out.closed() => {
                debug!(group = %self.consumer.group_id(), "Downstream dropped");
                Step::Stop
            }
        }
    }

    async fn fetch(&mut self) -> Step {
        let want = self
            .demand
            .get()
            .saturating_add(self.config.prefetch as u64)
            .saturating_sub(self.buffer.len() as u64)
            .min(self.config.max_batch_size as u64)
            .max(1) as usize;

        self.state.send_replace(SourceState::AwaitingFetch);
        {
            let mut metrics = self.metrics.write().await;
            metrics.fetches += 1;
            metrics.largest_fetch_request = metrics.largest_fetch_request.max(want);
        }

        let consumer = self.consumer.clone();
        let timeout = self.fetch_timeout;
        let fetch = async move { consumer.fetch(want, timeout).await };

        match self.until_cancelled(fetch).await {
            None => {
                debug!(group = %self.consumer.group_id(), "Outstanding fetch aborted");
                Step::Stop
            }
            Some(Ok(batch)) => {
                self.retries = 0;
                debug!(
                    group = %self.consumer.group_id(),
                    requested = want,
                    count = batch.len(),
                    "Fetched batch"
                );
                self.buffer.extend(batch);
                Step::Continue
            }
            Some(Err(e)) => {
                self.metrics.write().await.fetch_errors += 1;
                if !e.is_retryable() || self.retries >= self.config.max_fetch_retries {
                    return Step::Fail(e);
                }

                self.retries += 1;
                warn!(
                    group = %self.consumer.group_id(),
                    attempt = self.retries,
                    error = %e,
                    "Fetch failed, retrying"
                );
                match self.until_cancelled(tokio::time::sleep(self.config.retry_backoff)).await {
                    Some(()) => Step::Continue,
                    None => Step::Stop,
                }
            }
        }
    }

    async fn deliver_one(&mut self) -> Step {
        self.state.send_replace(SourceState::Delivering);

        // The permit borrows this sender, not the actor
        let out = self.out.clone();
        let permit = tokio::select! {
            biased;
            command = self.commands.recv() => {
                return if self.handle_command(command).await {
                    Step::Continue
                } else {
                    Step::Stop
                };
            }
            permit = out.reserve() => permit,
        };

        let Ok(permit) = permit else {
            debug!(group = %self.consumer.group_id(), "Downstream dropped");
            return Step::Stop;
        };
        if let Some(envelope) = self.buffer.pop_front() {
            if self.demand.take_one() {
                permit.send(Signal::Next(envelope));
                self.metrics.write().await.emitted += 1;
            } else {
                self.buffer.push_front(envelope);
            }
        }
        Step::Continue
    }

    async fn emit_error(&mut self, e: BridgeError) {
        error!(
            group = %self.consumer.group_id(),
            error = %e,
            severity = %e.severity(),
            "Source failed"
        );
        let out = self.out.clone();
        let _ = self
            .until_cancelled(async move { out.send(Signal::Error(e)).await })
            .await;
    }

    async fn teardown(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        match self.consumer.close().await {
            Ok(true) => info!(group = %self.consumer.group_id(), "Source stopped, consumer closed"),
            Ok(false) => debug!(group = %self.consumer.group_id(), "Consumer already closed"),
            Err(e) => warn!(group = %self.consumer.group_id(), error = %e, "Failed to close consumer"),
        }
        self.state.send_replace(SourceState::Cancelled);
    }
}
