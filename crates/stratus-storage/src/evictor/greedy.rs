//! Largest-first eviction

use super::Evictor;
use crate::events::BlockStoreEventListener;
use crate::meta::DirSnapshot;
use std::cmp::Reverse;
use stratus_common::BlockId;

/// Evicts the largest blocks first, lowest id on ties
#[derive(Debug, Default)]
pub struct GreedyEvictor;

impl BlockStoreEventListener for GreedyEvictor {}

impl Evictor for GreedyEvictor {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn candidates(&self, snapshot: &DirSnapshot) -> Vec<(BlockId, u64)> {
        let mut blocks = snapshot.blocks.clone();
        blocks.sort_unstable_by_key(|(id, size)| (Reverse(*size), *id));
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evictor::tests::snapshot;

    #[test]
    fn test_largest_first() {
        let snap = snapshot(1000, &[(1, 100), (2, 400), (3, 400), (4, 50)]);
        let order: Vec<_> = GreedyEvictor
            .candidates(&snap)
            .into_iter()
            .map(|(id, _)| id.as_u64())
            .collect();
        assert_eq!(order, vec![2, 3, 1, 4]);
    }
}
