//! Demand-driven stream adapters
//!
//! Each adapter is one task that owns its state and talks to its neighbours
//! over channels. Downstream stages pull with [`Subscription::request`];
//! upstream stages push at most the requested number of
//! [`Signal::Next`] elements.
//!
//! # Features
//!
//! - **DemandSource**: broker consumer exposed as a backpressured publisher
//! - **DemandSink**: broker producer fed under a [`RequestStrategy`]
//! - **CommitSink**: batches acknowledged offsets into an offset committer
//! - **PublisherWithCommitSink**: a source and a commit sink bound to one consumer

mod commit_sink;
mod pairing;
mod sink;
mod source;

pub use commit_sink::{CommitSink, CommitSinkStats};
pub use pairing::PublisherWithCommitSink;
pub use sink::{
    DemandSink, RequestStrategy, SinkHandle, SinkMetrics, SinkTermination,
    WatermarkRequestStrategy,
};
pub use source::{DemandSource, SourceHandle, SourceMetrics, SourceState};

use crate::error::BridgeError;

/// Element or terminal event flowing downstream
#[derive(Debug)]
pub enum Signal<T> {
    Next(T),
    /// Terminal failure; nothing follows
    Error(BridgeError),
    /// Terminal completion; nothing follows
    Complete,
}

impl<T> Signal<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }
}

/// Downstream's handle on an upstream publisher
pub trait Subscription: Send + Sync {
    /// Ask for `n` more elements
    fn request(&self, n: u64);

    /// Stop the publisher. Repeated calls are no-ops.
    fn cancel(&self);
}

/// Outstanding demand; additions saturate instead of overflowing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Demand(u64);

impl Demand {
    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn add(&mut self, n: u64) {
        self.0 = self.0.saturating_add(n);
    }

    /// Consume one unit; returns false when there was none
    pub fn take_one(&mut self) -> bool {
        match self.0.checked_sub(1) {
            Some(rest) => {
                self.0 = rest;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demand_saturates() {
        let mut demand = Demand::default();
        assert!(demand.is_zero());
        assert!(!demand.take_one());

        demand.add(u64::MAX);
        demand.add(5);
        assert_eq!(demand.get(), u64::MAX);

        assert!(demand.take_one());
        assert_eq!(demand.get(), u64::MAX - 1);
    }

    #[test]
    fn test_signal_terminal() {
        assert!(!Signal::Next(1).is_terminal());
        assert!(Signal::<u8>::Complete.is_terminal());
        assert!(Signal::<u8>::Error(BridgeError::Cancelled).is_terminal());
    }
}
