use bridge_config::MergePolicyKind;
use std::fmt;
use std::sync::Arc;

use super::OffsetMap;

/// Resolves a stored offset against a proposed one for a single partition.
///
/// Both values use the same convention (last consumed offset). Implementations
/// must be pure.
pub trait MergePolicy: fmt::Debug + Send + Sync {
    /// Resolve one partition; `stored` is `None` when nothing is persisted yet
    fn resolve(&self, stored: Option<i64>, proposed: i64) -> i64;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// The committing caller's value always replaces the stored one.
///
/// A concurrent committer that already persisted a newer offset for the same
/// group and partition is overwritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallerWins;

impl MergePolicy for CallerWins {
    fn resolve(&self, _stored: Option<i64>, proposed: i64) -> i64 {
        proposed
    }

    fn name(&self) -> &'static str {
        "caller_wins"
    }
}

/// The larger of stored and proposed is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestWins;

impl MergePolicy for HighestWins {
    fn resolve(&self, stored: Option<i64>, proposed: i64) -> i64 {
        stored.map_or(proposed, |s| s.max(proposed))
    }

    fn name(&self) -> &'static str {
        "highest_wins"
    }
}

/// Policy instance for a configured kind
pub fn merge_policy(kind: MergePolicyKind) -> Arc<dyn MergePolicy> {
    match kind {
        MergePolicyKind::CallerWins => Arc::new(CallerWins),
        MergePolicyKind::HighestWins => Arc::new(HighestWins),
    }
}

/// Merge `proposed` over `stored`.
///
/// The result has exactly the keys of `proposed`; stored entries for other
/// partitions are ignored.
pub fn merge(stored: &OffsetMap, proposed: &OffsetMap, policy: &dyn MergePolicy) -> OffsetMap {
    proposed
        .iter()
        .map(|(partition, offset)| {
            let resolved = policy.resolve(stored.get(partition), *offset);
            (partition.clone(), resolved)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offsets::TopicPartition;

    fn map(entries: &[(i32, i64)]) -> OffsetMap {
        entries
            .iter()
            .map(|(p, o)| (TopicPartition::new("t", *p), *o))
            .collect()
    }

    #[test]
    fn test_caller_wins() {
        let stored = map(&[(0, 10), (1, 3), (2, 8)]);
        let proposed = map(&[(0, 4), (1, 5)]);

        let merged = merge(&stored, &proposed, &CallerWins);
        assert_eq!(merged, map(&[(0, 4), (1, 5)]));
    }

    #[test]
    fn test_highest_wins() {
        let stored = map(&[(0, 10), (1, 3)]);
        let proposed = map(&[(0, 4), (1, 5), (3, 1)]);

        let merged = merge(&stored, &proposed, &HighestWins);
        assert_eq!(merged, map(&[(0, 10), (1, 5), (3, 1)]));
    }

    #[test]
    fn test_policy_from_config() {
        assert_eq!(merge_policy(MergePolicyKind::CallerWins).name(), "caller_wins");
        assert_eq!(merge_policy(MergePolicyKind::HighestWins).name(), "highest_wins");
    }
}
