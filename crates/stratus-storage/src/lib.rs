//! Stratus Storage Engine - Tiered block store
//!
//! This crate implements the worker-side block store of Stratus including:
//! - Tier/dir hierarchy with per-dir capacity accounting
//! - Block metadata index (committed and temporary blocks)
//! - Pluggable allocation (max-free, greedy, round-robin)
//! - Pluggable eviction (LRU, greedy) with optional demotion to lower tiers
//! - Per-block reader/writer locks owned by sessions
//! - Capacity reports, session tracking and the background space reserver

pub mod allocator;
pub mod events;
pub mod evictor;
pub mod layout;
pub mod lock;
pub mod manager;
pub mod meta;
pub mod reserver;
pub mod session;
pub mod stats;
pub mod store;
pub mod store_meta;

#[cfg(test)]
mod test_utils;

// Re-exports
pub use allocator::{Allocator, GreedyAllocator, MaxFreeAllocator, RoundRobinAllocator, create_allocator};
pub use events::BlockStoreEventListener;
pub use evictor::{Evictor, GreedyEvictor, LruEvictor, create_evictor, plan_eviction};
pub use lock::{BlockLockManager, LockRecord};
pub use manager::BlockMetadataManager;
pub use meta::{BlockMeta, DirSnapshot, SpaceReservation, StorageDir, StorageTier, TempBlockMeta};
pub use reserver::SpaceReserver;
pub use session::SessionTracker;
pub use stats::{StoreStats, StoreStatsSnapshot};
pub use store::TieredBlockStore;
pub use store_meta::{BlockStoreMeta, DirUsage, TierUsage};
