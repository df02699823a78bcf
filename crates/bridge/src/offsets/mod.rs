//! Partition identifiers and offset maps
//!
//! # Features
//!
//! - **TopicPartition**: ordered, hashable partition identifier
//! - **OffsetMap**: persistent map of last consumed offsets with diff/union
//! - **CommitRequest**: next-to-read offsets plus the time the request was formed
//! - **Merge policies**: pure reconciliation of stored and proposed offsets

mod merge;
mod offset_map;
mod partition;

pub use merge::{merge, merge_policy, CallerWins, HighestWins, MergePolicy};
pub use offset_map::{CommitRequest, OffsetMap, UNKNOWN_OFFSET};
pub use partition::TopicPartition;
