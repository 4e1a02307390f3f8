//! Round-robin allocation

use super::{Allocator, scoped_dirs};
use crate::meta::{StorageDir, StorageTier};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stratus_common::BlockStoreLocation;

/// Rotates over the dirs of a tier, skipping dirs without room
///
/// Each tier keeps its own cursor; the first tier with a fitting dir wins.
#[derive(Debug, Default)]
pub struct RoundRobinAllocator {
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobinAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for RoundRobinAllocator {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select_dir(
        &self,
        tiers: &[Arc<StorageTier>],
        bytes: u64,
        scope: &BlockStoreLocation,
    ) -> Option<Arc<StorageDir>> {
        if scope.dir_index().is_some() {
            return scoped_dirs(tiers, scope)
                .into_iter()
                .flat_map(|(_, dirs)| dirs.iter())
                .find(|dir| dir.available_bytes() >= bytes)
                .cloned();
        }

        let mut cursors = self.cursors.lock();
        for (alias, dirs) in scoped_dirs(tiers, scope) {
            if dirs.is_empty() {
                continue;
            }
            let start = cursors.get(alias).copied().unwrap_or(0) % dirs.len();
            for offset in 0..dirs.len() {
                let index = (start + offset) % dirs.len();
                if dirs[index].available_bytes() >= bytes {
                    cursors.insert(alias.to_string(), index + 1);
                    return Some(Arc::clone(&dirs[index]));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::tests::open_tiers;
    use tempfile::tempdir;

    #[test]
    fn test_rotates_over_dirs() {
        let root = tempdir().unwrap();
        let tiers = open_tiers(root.path(), &[("SSD", &[100, 100, 100])]);
        let allocator = RoundRobinAllocator::new();
        let scope = BlockStoreLocation::any_tier();

        let picked: Vec<_> = (0..4)
            .map(|_| allocator.select_dir(&tiers, 10, &scope).unwrap().dir_index())
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_skips_full_dirs() {
        let root = tempdir().unwrap();
        let tiers = open_tiers(root.path(), &[("MEM", &[50]), ("SSD", &[100, 300])]);
        let allocator = RoundRobinAllocator::new();

        let dir = allocator
            .select_dir(&tiers, 200, &BlockStoreLocation::any_tier())
            .unwrap();
        assert_eq!((dir.tier_alias(), dir.dir_index()), ("SSD", 1));

        assert!(allocator
            .select_dir(&tiers, 200, &BlockStoreLocation::dir("SSD", 0))
            .is_none());
    }
}
