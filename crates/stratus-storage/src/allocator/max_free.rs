//! Most-free-space allocation

use super::{Allocator, scoped_dirs};
use crate::meta::{StorageDir, StorageTier};
use std::sync::Arc;
use stratus_common::BlockStoreLocation;

/// Picks, in the first tier with room, the dir with the most available bytes
///
/// Ties go to the lowest dir index.
#[derive(Debug, Default)]
pub struct MaxFreeAllocator;

impl Allocator for MaxFreeAllocator {
    fn name(&self) -> &'static str {
        "max_free"
    }

    fn select_dir(
        &self,
        tiers: &[Arc<StorageTier>],
        bytes: u64,
        scope: &BlockStoreLocation,
    ) -> Option<Arc<StorageDir>> {
        for (_, dirs) in scoped_dirs(tiers, scope) {
            let mut best: Option<(&Arc<StorageDir>, u64)> = None;
            for dir in dirs {
                let available = dir.available_bytes();
                if available < bytes {
                    continue;
                }
                if best.is_none_or(|(_, most)| available > most) {
                    best = Some((dir, available));
                }
            }
            if let Some((dir, _)) = best {
                return Some(Arc::clone(dir));
            }
        }
        None
    }
}
