//! Store statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operation counters of a block store
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Temporary blocks created
    pub blocks_created: AtomicU64,
    /// Blocks committed
    pub blocks_committed: AtomicU64,
    /// Temporary blocks aborted, including session cleanup
    pub blocks_aborted: AtomicU64,
    /// Blocks removed on request
    pub blocks_removed: AtomicU64,
    /// Blocks moved on request
    pub blocks_moved: AtomicU64,
    /// Blocks deleted to make room
    pub blocks_evicted: AtomicU64,
    /// Blocks moved to a lower tier to make room
    pub blocks_demoted: AtomicU64,
    /// Bytes freed by eviction and demotion
    pub bytes_evicted: AtomicU64,
    /// Allocations that failed with no space
    pub allocation_failures: AtomicU64,
    /// Lock waits that hit their deadline
    pub lock_timeouts: AtomicU64,
}

/// Plain copy of [`StoreStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatsSnapshot {
    pub blocks_created: u64,
    pub blocks_committed: u64,
    pub blocks_aborted: u64,
    pub blocks_removed: u64,
    pub blocks_moved: u64,
    pub blocks_evicted: u64,
    pub blocks_demoted: u64,
    pub bytes_evicted: u64,
    pub allocation_failures: u64,
    pub lock_timeouts: u64,
}

impl StoreStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            blocks_created: self.blocks_created.load(Ordering::Relaxed),
            blocks_committed: self.blocks_committed.load(Ordering::Relaxed),
            blocks_aborted: self.blocks_aborted.load(Ordering::Relaxed),
            blocks_removed: self.blocks_removed.load(Ordering::Relaxed),
            blocks_moved: self.blocks_moved.load(Ordering::Relaxed),
            blocks_evicted: self.blocks_evicted.load(Ordering::Relaxed),
            blocks_demoted: self.blocks_demoted.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.blocks_created,
            &self.blocks_committed,
            &self.blocks_aborted,
            &self.blocks_removed,
            &self.blocks_moved,
            &self.blocks_evicted,
            &self.blocks_demoted,
            &self.bytes_evicted,
            &self.allocation_failures,
            &self.lock_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
