//! Configuration types for Stratus
//!
//! This module defines the configuration of a worker's tiered store. Tiers
//! are listed in priority order: the first tier is level 0 and receives new
//! writes first.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration of a tiered block store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Tiers, highest priority first
    pub tiers: Vec<TierConfig>,
    /// Allocation policy and retry bound
    pub allocation: AllocationConfig,
    /// Eviction policy
    pub eviction: EvictionConfig,
    /// Block lock settings
    pub lock: LockConfig,
    /// Session expiry settings
    pub session: SessionConfig,
    /// Background space reserver
    pub reserver: ReserverConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tiers: vec![TierConfig {
                alias: "MEM".to_string(),
                dirs: vec![DirConfig {
                    path: PathBuf::from("/mnt/ramdisk/stratus"),
                    capacity_bytes: 1024 * 1024 * 1024, // 1 GB
                }],
                reserved_bytes: 0,
            }],
            allocation: AllocationConfig::default(),
            eviction: EvictionConfig::default(),
            lock: LockConfig::default(),
            session: SessionConfig::default(),
            reserver: ReserverConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Check the configuration for structural errors
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(Error::configuration("at least one tier is required"));
        }

        let mut aliases = HashSet::new();
        let mut paths = HashSet::new();
        for tier in &self.tiers {
            if tier.alias.is_empty() {
                return Err(Error::configuration("tier alias must not be empty"));
            }
            if !aliases.insert(tier.alias.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate tier alias: {}",
                    tier.alias
                )));
            }
            if tier.dirs.is_empty() {
                return Err(Error::configuration(format!(
                    "tier {} has no dirs",
                    tier.alias
                )));
            }
            for dir in &tier.dirs {
                if dir.capacity_bytes == 0 {
                    return Err(Error::configuration(format!(
                        "dir {} in tier {} has zero capacity",
                        dir.path.display(),
                        tier.alias
                    )));
                }
                if !paths.insert(dir.path.clone()) {
                    return Err(Error::configuration(format!(
                        "dir {} is configured more than once",
                        dir.path.display()
                    )));
                }
            }
            if tier.reserved_bytes > tier.capacity_bytes() {
                return Err(Error::configuration(format!(
                    "tier {} reserves {} bytes but has only {} bytes of capacity",
                    tier.alias,
                    tier.reserved_bytes,
                    tier.capacity_bytes()
                )));
            }
        }

        if self.lock.timeout_ms == 0 {
            return Err(Error::configuration("lock.timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Total configured capacity across all tiers
    #[must_use]
    pub fn total_capacity_bytes(&self) -> u64 {
        self.tiers.iter().map(TierConfig::capacity_bytes).sum()
    }
}

/// Configuration of one storage tier
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier alias, e.g. "MEM", "SSD", "HDD"
    pub alias: String,
    /// Dirs of this tier, each an independent capacity pool
    pub dirs: Vec<DirConfig>,
    /// Bytes the space reserver keeps free in this tier
    #[serde(default)]
    pub reserved_bytes: u64,
}

impl TierConfig {
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.dirs.iter().map(|d| d.capacity_bytes).sum()
    }
}

/// Configuration of one storage dir
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirConfig {
    /// Path where block files live
    pub path: PathBuf,
    /// Capacity in bytes
    pub capacity_bytes: u64,
}

/// Allocation policy selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorKind {
    /// Dir with the most free bytes in the first tier that fits
    #[default]
    MaxFree,
    /// First dir that fits, in priority order
    Greedy,
    /// Rotate across the dirs of a tier
    RoundRobin,
}

impl AllocatorKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MaxFree => "max_free",
            Self::Greedy => "greedy",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for AllocatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "max_free" | "max-free" | "maxfree" => Ok(Self::MaxFree),
            "greedy" => Ok(Self::Greedy),
            "round_robin" | "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            _ => Err(Error::configuration(format!("unknown allocator: {s}"))),
        }
    }
}

/// Eviction policy selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictorKind {
    /// Least recently used first
    #[default]
    Lru,
    /// Largest blocks first
    Greedy,
}

impl EvictorKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Greedy => "greedy",
        }
    }
}

impl fmt::Display for EvictorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for EvictorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "greedy" => Ok(Self::Greedy),
            _ => Err(Error::configuration(format!("unknown evictor: {s}"))),
        }
    }
}

/// Allocation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub policy: AllocatorKind,
    /// Attempts at evict-then-reserve before giving up
    pub max_retries: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            policy: AllocatorKind::MaxFree,
            max_retries: 3,
        }
    }
}

/// Eviction configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub policy: EvictorKind,
    /// Demote victims to the next tier instead of deleting them
    pub cascade: bool,
    /// Allow evicting blocks that only have READ holders; their leases are revoked
    pub evict_read_locked: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: EvictorKind::Lru,
            cascade: false,
            evict_read_locked: false,
        }
    }
}

/// Block lock configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum wait for a conflicting holder (milliseconds)
    pub timeout_ms: u64,
}

impl LockConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

/// Session expiry configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session is considered dead (milliseconds)
    pub timeout_ms: u64,
    /// Interval between expiry sweeps (milliseconds)
    pub sweep_interval_ms: u64,
}

impl SessionConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            sweep_interval_ms: 1000,
        }
    }
}

/// Space reserver configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserverConfig {
    pub enabled: bool,
    /// Interval between checks (milliseconds)
    pub interval_ms: u64,
}

impl ReserverConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ReserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
        }
    }
}
