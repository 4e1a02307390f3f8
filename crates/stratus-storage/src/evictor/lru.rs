//! Least-recently-used eviction

use super::Evictor;
use crate::events::BlockStoreEventListener;
use crate::meta::DirSnapshot;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use stratus_common::{BlockId, BlockStoreLocation, SessionId};

/// Evicts the blocks touched longest ago first
///
/// Uses a logical clock: each commit or access stamps the block with the
/// next tick. Blocks never seen since startup count as oldest.
#[derive(Debug, Default)]
pub struct LruEvictor {
    clock: AtomicU64,
    last_access: DashMap<BlockId, u64>,
}

impl LruEvictor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&self, block_id: BlockId) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_access.insert(block_id, tick);
    }

    fn forget(&self, block_id: BlockId) {
        self.last_access.remove(&block_id);
    }

    /// Number of blocks with a recorded access
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.last_access.len()
    }
}

impl BlockStoreEventListener for LruEvictor {
    fn on_commit_block(&self, _session_id: SessionId, block_id: BlockId, _location: &BlockStoreLocation) {
        self.touch(block_id);
    }

    fn on_access_block(&self, _session_id: SessionId, block_id: BlockId) {
        self.touch(block_id);
    }

    fn on_remove_block(&self, _session_id: SessionId, block_id: BlockId) {
        self.forget(block_id);
    }

    fn on_evict_block(&self, block_id: BlockId, _from: &BlockStoreLocation) {
        self.forget(block_id);
    }
}

impl Evictor for LruEvictor {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn candidates(&self, snapshot: &DirSnapshot) -> Vec<(BlockId, u64)> {
        let mut blocks: Vec<_> = snapshot
            .blocks
            .iter()
            .map(|&(id, size)| {
                let tick = self.last_access.get(&id).map_or(0, |t| *t);
                (tick, id, size)
            })
            .collect();
        blocks.sort_unstable();
        blocks.into_iter().map(|(_, id, size)| (id, size)).collect()
    }
}
