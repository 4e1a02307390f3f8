//! Eviction policies
//!
//! An evictor only orders candidates. The store builds the plan from the
//! blocks that are not locked, checks that the plan can cover the request
//! and then removes (or demotes) victims one at a time under the dir mutex.
//!
//! # Policies
//!
//! - `lru`: least recently committed or accessed first (default)
//! - `greedy`: largest blocks first

mod greedy;
mod lru;

pub use greedy::GreedyEvictor;
pub use lru::LruEvictor;

use crate::events::BlockStoreEventListener;
use crate::meta::DirSnapshot;
use std::sync::Arc;
use stratus_common::{BlockId, EvictorKind};

/// Victim ordering policy
///
/// The store feeds block events to the evictor so access-ordered policies
/// stay current.
pub trait Evictor: BlockStoreEventListener {
    /// Policy name for logging
    fn name(&self) -> &'static str;

    /// Committed blocks of `snapshot` as (id, size), first victim first
    fn candidates(&self, snapshot: &DirSnapshot) -> Vec<(BlockId, u64)>;
}

/// Create the evictor for a policy
#[must_use]
pub fn create_evictor(kind: EvictorKind) -> Arc<dyn Evictor> {
    match kind {
        EvictorKind::Lru => Arc::new(LruEvictor::new()),
        EvictorKind::Greedy => Arc::new(GreedyEvictor),
    }
}

/// Victims that free at least `bytes` in the dir of `snapshot`
///
/// Only blocks accepted by `is_evictable` are considered. Returns `None`
/// when even evicting all of them would not make `bytes` available, and an
/// empty plan when the dir already has room. The plan may be longer than
/// strictly needed; the caller stops once enough is free.
pub fn plan_eviction(
    evictor: &dyn Evictor,
    snapshot: &DirSnapshot,
    bytes: u64,
    mut is_evictable: impl FnMut(BlockId) -> bool,
) -> Option<Vec<(BlockId, u64)>> {
    if bytes > snapshot.capacity_bytes {
        return None;
    }
    if snapshot.available_bytes >= bytes {
        return Some(Vec::new());
    }

    let needed = bytes - snapshot.available_bytes;
    let victims: Vec<_> = evictor
        .candidates(snapshot)
        .into_iter()
        .filter(|(id, _)| is_evictable(*id))
        .collect();

    let evictable: u64 = victims.iter().map(|(_, size)| size).sum();
    if evictable < needed {
        return None;
    }
    Some(victims)
}
