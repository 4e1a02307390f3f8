//! Allocation policies
//!
//! An allocator picks the dir a new block (or a moved block) lands in. It
//! only chooses; the caller reserves the bytes in the chosen dir, and a
//! failed reservation after a concurrent allocation is retried by the store.
//!
//! # Policies
//!
//! - `max_free`: in the first tier with room, the dir with the most available bytes (default)
//! - `greedy`: the first dir with room, in tier and dir order
//! - `round_robin`: rotates over the dirs of a tier

mod greedy;
mod max_free;
mod round_robin;

pub use greedy::GreedyAllocator;
pub use max_free::MaxFreeAllocator;
pub use round_robin::RoundRobinAllocator;

use crate::meta::{StorageDir, StorageTier};
use std::sync::Arc;
use stratus_common::{AllocatorKind, BlockStoreLocation};

/// Dir selection policy
pub trait Allocator: Send + Sync {
    /// Policy name for logging
    fn name(&self) -> &'static str;

    /// Pick a dir inside `scope` with at least `bytes` available
    ///
    /// Never selects a dir outside `scope`. Tiers are considered in level
    /// order and the first tier with a fitting dir wins.
    fn select_dir(
        &self,
        tiers: &[Arc<StorageTier>],
        bytes: u64,
        scope: &BlockStoreLocation,
    ) -> Option<Arc<StorageDir>>;
}

/// Create the allocator for a policy
#[must_use]
pub fn create_allocator(kind: AllocatorKind) -> Arc<dyn Allocator> {
    match kind {
        AllocatorKind::MaxFree => Arc::new(MaxFreeAllocator),
        AllocatorKind::Greedy => Arc::new(GreedyAllocator),
        AllocatorKind::RoundRobin => Arc::new(RoundRobinAllocator::new()),
    }
}

/// Candidate dirs of `scope`, grouped by tier in level order
pub(crate) fn scoped_dirs<'a>(
    tiers: &'a [Arc<StorageTier>],
    scope: &BlockStoreLocation,
) -> Vec<(&'a str, &'a [Arc<StorageDir>])> {
    tiers
        .iter()
        .filter(|tier| {
            scope
                .tier_alias()
                .is_none_or(|alias| alias == tier.alias())
        })
        .map(|tier| {
            let dirs = match scope.dir_index() {
                Some(index) => tier.dirs().get(index..=index).unwrap_or(&[]),
                None => tier.dirs(),
            };
            (tier.alias(), dirs)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tier;
    use tempfile::tempdir;

    pub(super) fn open_tiers(root: &std::path::Path, layout: &[(&str, &[u64])]) -> Vec<Arc<StorageTier>> {
        layout
            .iter()
            .enumerate()
            .map(|(level, (alias, capacities))| {
                Arc::new(StorageTier::open(&tier(root, alias, capacities), level).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_scoped_dirs() {
        let root = tempdir().unwrap();
        let tiers = open_tiers(root.path(), &[("MEM", &[100]), ("SSD", &[100, 200])]);

        assert_eq!(scoped_dirs(&tiers, &BlockStoreLocation::any_tier()).len(), 2);

        let ssd = scoped_dirs(&tiers, &BlockStoreLocation::any_dir_in_tier("SSD"));
        assert_eq!(ssd.len(), 1);
        assert_eq!(ssd[0].1.len(), 2);

        let one = scoped_dirs(&tiers, &BlockStoreLocation::dir("SSD", 1));
        assert_eq!(one[0].1.len(), 1);
        assert_eq!(one[0].1[0].capacity_bytes(), 200);

        let missing = scoped_dirs(&tiers, &BlockStoreLocation::dir("SSD", 5));
        assert!(missing[0].1.is_empty());
    }

    #[test]
    fn test_factory() {
        assert_eq!(create_allocator(AllocatorKind::MaxFree).name(), "max_free");
        assert_eq!(create_allocator(AllocatorKind::Greedy).name(), "greedy");
        assert_eq!(create_allocator(AllocatorKind::RoundRobin).name(), "round_robin");
    }
}
