//! Storage structure: tiers, dirs and block records

mod block;
mod dir;
mod tier;

pub use block::{BlockMeta, TempBlockMeta};
pub use dir::{DirSnapshot, SpaceReservation, StorageDir};
pub use tier::StorageTier;
