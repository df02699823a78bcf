//! Broker producer fed by a demand-driven upstream
//!
//! The sink pulls records from upstream under a [`RequestStrategy`] and sends
//! each one to the producer without waiting for earlier sends to finish.
//! Every exit path closes the producer exactly once:
//!
//! - upstream completion drains in-flight sends, flushes and closes
//! - cancellation cancels upstream and closes
//! - a send failure cancels upstream, closes, and is returned from
//!   [`SinkHandle::join`] so the owner can log and escalate it

use bridge_config::SinkConfig;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Signal, Subscription};
use crate::broker::{BrokerProducer, DeliveryReport, ProducerRecord};
use crate::error::{BridgeError, Result};

const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HIGH_WATERMARK: usize = 16;
const DEFAULT_LOW_WATERMARK: usize = 4;

/// Decides how much to request from upstream
pub trait RequestStrategy: Send + Sync + std::fmt::Debug {
    /// Additional demand to signal, given `remaining` elements that were
    /// requested or received but not yet fully sent
    fn request_demand(&self, remaining: usize) -> usize;
}

/// Refill to `high` once remaining work drops below `low`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkRequestStrategy {
    high: usize,
    low: usize,
}

impl WatermarkRequestStrategy {
    pub fn new(high: usize, low: usize) -> Result<Self> {
        if low == 0 || low >= high {
            return Err(BridgeError::Configuration(format!(
                "watermarks require 0 < low < high (low={}, high={})",
                low, high
            )));
        }
        Ok(Self { high, low })
    }

    pub fn high(&self) -> usize {
        self.high
    }

    pub fn low(&self) -> usize {
        self.low
    }
}

impl Default for WatermarkRequestStrategy {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_WATERMARK,
            low: DEFAULT_LOW_WATERMARK,
        }
    }
}

impl TryFrom<&SinkConfig> for WatermarkRequestStrategy {
    type Error = BridgeError;

    fn try_from(config: &SinkConfig) -> Result<Self> {
        Self::new(config.high_watermark, config.low_watermark)
    }
}

impl RequestStrategy for WatermarkRequestStrategy {
    fn request_demand(&self, remaining: usize) -> usize {
        if remaining < self.low {
            self.high - remaining
        } else {
            0
        }
    }
}

/// How a sink ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SinkTermination {
    /// Upstream completed and every received record was sent
    Completed,
    /// Cancelled by the owner
    Cancelled,
}

/// Sink counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkMetrics {
    pub received: u64,
    pub sent: u64,
    pub failed: u64,
    pub requested: u64,
}

/// Owner's handle on a running [`DemandSink`]
#[derive(Debug)]
pub struct SinkHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<SinkTermination>>,
    metrics: Arc<RwLock<SinkMetrics>>,
}

impl SinkHandle {
    /// Stop the sink; repeated calls are no-ops
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn metrics(&self) -> SinkMetrics {
        self.metrics.read().await.clone()
    }

    /// Wait for the sink to terminate
    pub async fn join(self) -> Result<SinkTermination> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(BridgeError::consumption(format!("sink task aborted: {}", e))),
        }
    }
}

/// Builder for a producer-backed subscriber
pub struct DemandSink {
    producer: Arc<dyn BrokerProducer>,
    upstream: Arc<dyn Subscription>,
    strategy: Box<dyn RequestStrategy>,
    flush_timeout: Duration,
}

impl DemandSink {
    pub fn new(producer: Arc<dyn BrokerProducer>, upstream: Arc<dyn Subscription>) -> Self {
        Self {
            producer,
            upstream,
            strategy: Box::new(WatermarkRequestStrategy::default()),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    pub fn with_strategy(mut self, strategy: impl RequestStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Start consuming `elements`
    pub fn spawn(self, elements: mpsc::Receiver<Signal<ProducerRecord>>) -> SinkHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let metrics = Arc::new(RwLock::new(SinkMetrics::default()));

        let actor = SinkActor {
            producer: self.producer,
            upstream: self.upstream,
            strategy: self.strategy,
            flush_timeout: self.flush_timeout,
            elements,
            cancel: cancel_rx,
            cancel_open: true,
            upstream_done: false,
            outstanding: 0,
            in_flight: FuturesUnordered::new(),
            metrics: metrics.clone(),
        };

        SinkHandle {
            cancel: cancel_tx,
            task: tokio::spawn(actor.run()),
            metrics,
        }
    }
}

struct SinkActor {
    producer: Arc<dyn BrokerProducer>,
    upstream: Arc<dyn Subscription>,
    strategy: Box<dyn RequestStrategy>,
    flush_timeout: Duration,
    elements: mpsc::Receiver<Signal<ProducerRecord>>,
    cancel: watch::Receiver<bool>,
    cancel_open: bool,
    upstream_done: bool,
    /// Requested from upstream but not yet received
    outstanding: usize,
    in_flight: FuturesUnordered<BoxFuture<'static, Result<DeliveryReport>>>,
    metrics: Arc<RwLock<SinkMetrics>>,
}

impl SinkActor {
    async fn run(mut self) -> Result<SinkTermination> {
        info!("Sink started");

        loop {
            if !self.upstream_done {
                self.replenish().await;
            } else if self.in_flight.is_empty() {
                return self.complete().await;
            }

            tokio::select! {
                biased;
                changed = self.cancel.changed(), if self.cancel_open => {
                    if changed.is_err() {
                        self.cancel_open = false;
                    } else {
                        let cancelled = *self.cancel.borrow_and_update();
                        if cancelled {
                            return self.cancelled().await;
                        }
                    }
                }
                Some(result) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    match result {
                        Ok(report) => {
                            self.metrics.write().await.sent += 1;
                            debug!(partition = report.partition, offset = report.offset, "Record delivered");
                        }
                        Err(e) => {
                            self.metrics.write().await.failed += 1;
                            return self.fail(e).await;
                        }
                    }
                }
                signal = self.elements.recv(), if !self.upstream_done => {
                    match signal {
                        Some(Signal::Next(record)) => self.send(record).await,
                        Some(Signal::Complete) | None => {
                            debug!(in_flight = self.in_flight.len(), "Upstream completed");
                            self.upstream_done = true;
                        }
                        Some(Signal::Error(e)) => {
                            self.upstream_done = true;
                            return self.upstream_failed(e).await;
                        }
                    }
                }
            }
        }
    }

    async fn replenish(&mut self) {
        let remaining = self.outstanding + self.in_flight.len();
        let n = self.strategy.request_demand(remaining);
        if n > 0 {
            self.outstanding += n;
            self.metrics.write().await.requested += n as u64;
            self.upstream.request(n as u64);
        }
    }

    async fn send(&mut self, record: ProducerRecord) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.metrics.write().await.received += 1;

        let producer = self.producer.clone();
        self.in_flight
            .push(Box::pin(async move { producer.send(record).await }));
    }

    async fn complete(&mut self) -> Result<SinkTermination> {
        if let Err(e) = self.producer.flush(self.flush_timeout).await {
            warn!(error = %e, "Producer flush failed on completion");
        }
        self.close_producer().await;
        info!("Sink completed");
        Ok(SinkTermination::Completed)
    }

    async fn cancelled(&mut self) -> Result<SinkTermination> {
        self.upstream.cancel();
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        self.close_producer().await;
        info!(dropped_in_flight = dropped, "Sink cancelled");
        Ok(SinkTermination::Cancelled)
    }

    async fn fail(&mut self, e: BridgeError) -> Result<SinkTermination> {
        self.upstream.cancel();
        self.in_flight.clear();
        self.close_producer().await;
        error!(error = %e, severity = %e.severity(), "Sink send failed, terminating");
        Err(e)
    }

    async fn upstream_failed(&mut self, e: BridgeError) -> Result<SinkTermination> {
        self.in_flight.clear();
        self.close_producer().await;
        error!(error = %e, "Upstream failed, sink terminating");
        Err(e)
    }

    async fn close_producer(&mut self) {
        match self.producer.close().await {
            Ok(true) => debug!("Producer closed"),
            Ok(false) => debug!("Producer was already closed"),
            Err(e) => warn!(error = %e, "Failed to close producer"),
        }
    }
}
