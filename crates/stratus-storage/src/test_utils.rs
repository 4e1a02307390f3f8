//! Shared fixtures for unit tests

use std::path::Path;
use stratus_common::{DirConfig, StoreConfig, TierConfig};

/// MEM tier with one dir, SSD tier with one dir, all under `root`
pub fn two_tier_config(root: &Path, mem_capacity: u64, ssd_capacity: u64) -> StoreConfig {
    StoreConfig {
        tiers: vec![
            tier(root, "MEM", &[mem_capacity]),
            tier(root, "SSD", &[ssd_capacity]),
        ],
        ..Default::default()
    }
}

/// A tier with one dir per entry of `capacities`
pub fn tier(root: &Path, alias: &str, capacities: &[u64]) -> TierConfig {
    TierConfig {
        alias: alias.to_string(),
        dirs: capacities
            .iter()
            .enumerate()
            .map(|(i, capacity)| DirConfig {
                path: root.join(format!("{}{}", alias.to_lowercase(), i)),
                capacity_bytes: *capacity,
            })
            .collect(),
        reserved_bytes: 0,
    }
}
