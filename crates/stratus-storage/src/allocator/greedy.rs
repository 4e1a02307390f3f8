//! First-fit allocation

use super::{Allocator, scoped_dirs};
use crate::meta::{StorageDir, StorageTier};
use std::sync::Arc;
use stratus_common::BlockStoreLocation;

/// Picks the first dir with room, in tier and dir order
#[derive(Debug, Default)]
pub struct GreedyAllocator;

impl Allocator for GreedyAllocator {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn select_dir(
        &self,
        tiers: &[Arc<StorageTier>],
        bytes: u64,
        scope: &BlockStoreLocation,
    ) -> Option<Arc<StorageDir>> {
        scoped_dirs(tiers, scope)
            .into_iter()
            .flat_map(|(_, dirs)| dirs.iter())
            .find(|dir| dir.available_bytes() >= bytes)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::tests::open_tiers;
    use tempfile::tempdir;

    #[test]
    fn test_first_fit() {
        let root = tempdir().unwrap();
        let tiers = open_tiers(root.path(), &[("MEM", &[100, 300]), ("SSD", &[1000])]);

        let dir = GreedyAllocator
            .select_dir(&tiers, 50, &BlockStoreLocation::any_tier())
            .unwrap();
        assert_eq!((dir.tier_alias(), dir.dir_index()), ("MEM", 0));

        let dir = GreedyAllocator
            .select_dir(&tiers, 200, &BlockStoreLocation::any_tier())
            .unwrap();
        assert_eq!((dir.tier_alias(), dir.dir_index()), ("MEM", 1));

        let dir = GreedyAllocator
            .select_dir(&tiers, 500, &BlockStoreLocation::any_tier())
            .unwrap();
        assert_eq!(dir.tier_alias(), "SSD");

        assert!(GreedyAllocator
            .select_dir(&tiers, 500, &BlockStoreLocation::any_dir_in_tier("MEM"))
            .is_none());
    }
}
