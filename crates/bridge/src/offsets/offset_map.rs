use chrono::{DateTime, Utc};
use std::collections::btree_map;
use std::collections::BTreeMap;

use super::TopicPartition;
use crate::error::{BridgeError, Result};

/// Sentinel returned by [`OffsetMap::last_offset`] for partitions with no
/// known offset.
pub const UNKNOWN_OFFSET: i64 = -1;

/// Immutable map from partition to the last consumed offset.
///
/// Every update returns a new map and leaves the receiver untouched.
/// Negative offsets are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap {
    offsets: BTreeMap<TopicPartition, i64>,
}

impl OffsetMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Last consumed offset for `partition`, or [`UNKNOWN_OFFSET`]
    pub fn last_offset(&self, partition: &TopicPartition) -> i64 {
        self.get(partition).unwrap_or(UNKNOWN_OFFSET)
    }

    pub fn get(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets.get(partition).copied()
    }

    pub fn contains(&self, partition: &TopicPartition) -> bool {
        self.offsets.contains_key(partition)
    }

    /// New map with `partition` set to `offset`.
    ///
    /// A negative offset leaves the map unchanged; use
    /// [`OffsetMap::checked_plus_offset`] to have it rejected instead.
    pub fn plus_offset(&self, partition: TopicPartition, offset: i64) -> OffsetMap {
        if offset < 0 {
            return self.clone();
        }
        let mut offsets = self.offsets.clone();
        offsets.insert(partition, offset);
        OffsetMap { offsets }
    }

    /// Like [`OffsetMap::plus_offset`] but fails on a negative offset
    pub fn checked_plus_offset(&self, partition: TopicPartition, offset: i64) -> Result<OffsetMap> {
        if offset < 0 {
            return Err(BridgeError::InvalidOffset {
                partition: partition.to_string(),
                offset,
            });
        }
        Ok(self.plus_offset(partition, offset))
    }

    /// Entries of `self` that do not appear with an identical value in `other`.
    ///
    /// Keys present in both maps with different offsets are kept.
    pub fn diff(&self, other: &OffsetMap) -> OffsetMap {
        self.offsets
            .iter()
            .filter(|(partition, offset)| other.get(partition) != Some(**offset))
            .map(|(partition, offset)| (partition.clone(), *offset))
            .collect()
    }

    /// Union of both maps; `other` wins on shared keys
    pub fn union(&self, other: &OffsetMap) -> OffsetMap {
        let mut offsets = self.offsets.clone();
        offsets.extend(other.offsets.iter().map(|(p, o)| (p.clone(), *o)));
        OffsetMap { offsets }
    }

    /// New map without the given partitions
    pub fn without(&self, partitions: &[TopicPartition]) -> OffsetMap {
        self.offsets
            .iter()
            .filter(|(partition, _)| !partitions.contains(partition))
            .map(|(partition, offset)| (partition.clone(), *offset))
            .collect()
    }

    /// Same keys with every offset shifted by `delta`.
    ///
    /// Entries that would become negative are dropped.
    pub fn shifted(&self, delta: i64) -> OffsetMap {
        self.offsets
            .iter()
            .map(|(partition, offset)| (partition.clone(), offset.saturating_add(delta)))
            .collect()
    }

    /// Partitions in sorted order
    pub fn partitions(&self) -> Vec<TopicPartition> {
        self.offsets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, TopicPartition, i64> {
        self.offsets.iter()
    }

    /// Translate to the broker's commit convention.
    ///
    /// Every entry becomes `offset + 1` (next offset to read), saturating at
    /// `i64::MAX` like [`OffsetMap::shifted`]. The wall clock is read here and
    /// nowhere else; the timestamp is informational.
    pub fn to_commit_request(&self) -> CommitRequest {
        CommitRequest {
            offsets: self
                .offsets
                .iter()
                .map(|(partition, offset)| (partition.clone(), offset.saturating_add(1)))
                .collect(),
            formed_at: Utc::now(),
        }
    }
}

impl FromIterator<(TopicPartition, i64)> for OffsetMap {
    fn from_iter<I: IntoIterator<Item = (TopicPartition, i64)>>(iter: I) -> Self {
        OffsetMap {
            offsets: iter.into_iter().filter(|(_, offset)| *offset >= 0).collect(),
        }
    }
}

impl<'a> IntoIterator for &'a OffsetMap {
    type Item = (&'a TopicPartition, &'a i64);
    type IntoIter = btree_map::Iter<'a, TopicPartition, i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.offsets.iter()
    }
}

/// Offsets in "next offset to read" form, ready for a broker commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    offsets: BTreeMap<TopicPartition, i64>,
    /// When the request was formed (metadata only)
    pub formed_at: DateTime<Utc>,
}

impl CommitRequest {
    pub fn get(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets.get(partition).copied()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, TopicPartition, i64> {
        self.offsets.iter()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Commit metadata string attached to broker commits
    pub fn metadata(&self) -> String {
        self.formed_at.to_rfc3339()
    }

    /// The committed next-read offsets as an [`OffsetMap`]
    pub fn next_offsets(&self) -> OffsetMap {
        self.offsets.iter().map(|(p, o)| (p.clone(), *o)).collect()
    }
}
