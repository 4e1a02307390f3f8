//! Core type definitions for Stratus
//!
//! This module defines the identifiers and location types shared by the
//! storage engine and the worker.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a block within a worker's store
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct BlockId(u64);

impl BlockId {
    /// Create a block id from its raw value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Identifier of a client session (local or remote)
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct SessionId(u64);

impl SessionId {
    /// Session used by the store itself when evicting blocks
    pub const EVICTOR: SessionId = SessionId(u64::MAX - 1);
    /// Session used by the background space reserver
    pub const SPACE_RESERVER: SessionId = SessionId(u64::MAX - 2);
    /// Session used when demoting blocks to a lower tier
    pub const MIGRATE: SessionId = SessionId(u64::MAX - 3);

    /// Create a session id from its raw value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this id belongs to one of the store's internal sessions
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        self.0 >= u64::MAX - 3
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Identifier of a granted block lock
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct LockId(u64);

impl LockId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockId({})", self.0)
    }
}

/// Block lock mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared; many sessions may hold it at once
    Read,
    /// Exclusive; one session, no readers
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "READ"),
            Self::Write => write!(f, "WRITE"),
        }
    }
}

/// A location in the tier hierarchy, at one of three granularities
///
/// Used both as the resolved location of a block (always `Dir`) and as a
/// placement hint for allocation, eviction and moves.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStoreLocation {
    /// Any dir of any tier
    AnyTier,
    /// Any dir of the named tier
    AnyDirInTier { tier_alias: String },
    /// One specific dir
    Dir { tier_alias: String, dir_index: usize },
}

impl BlockStoreLocation {
    #[must_use]
    pub const fn any_tier() -> Self {
        Self::AnyTier
    }

    #[must_use]
    pub fn any_dir_in_tier(tier_alias: impl Into<String>) -> Self {
        Self::AnyDirInTier {
            tier_alias: tier_alias.into(),
        }
    }

    #[must_use]
    pub fn dir(tier_alias: impl Into<String>, dir_index: usize) -> Self {
        Self::Dir {
            tier_alias: tier_alias.into(),
            dir_index,
        }
    }

    /// Tier alias, if the location names one
    #[must_use]
    pub fn tier_alias(&self) -> Option<&str> {
        match self {
            Self::AnyTier => None,
            Self::AnyDirInTier { tier_alias } | Self::Dir { tier_alias, .. } => Some(tier_alias),
        }
    }

    /// Dir index, if the location names one
    #[must_use]
    pub const fn dir_index(&self) -> Option<usize> {
        match self {
            Self::Dir { dir_index, .. } => Some(*dir_index),
            _ => None,
        }
    }

    /// Whether `self` is contained in `other`
    ///
    /// A concrete dir belongs to its tier and to `AnyTier`; a tier belongs
    /// to `AnyTier`.
    #[must_use]
    pub fn belongs_to(&self, other: &BlockStoreLocation) -> bool {
        match (self, other) {
            (_, Self::AnyTier) => true,
            (Self::AnyTier, _) => false,
            (
                Self::AnyDirInTier { tier_alias } | Self::Dir { tier_alias, .. },
                Self::AnyDirInTier { tier_alias: other },
            ) => tier_alias == other,
            (Self::AnyDirInTier { .. }, Self::Dir { .. }) => false,
            (
                Self::Dir {
                    tier_alias,
                    dir_index,
                },
                Self::Dir {
                    tier_alias: other_alias,
                    dir_index: other_index,
                },
            ) => tier_alias == other_alias && dir_index == other_index,
        }
    }
}

impl Default for BlockStoreLocation {
    fn default() -> Self {
        Self::AnyTier
    }
}

impl fmt::Display for BlockStoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnyTier => write!(f, "any tier"),
            Self::AnyDirInTier { tier_alias } => write!(f, "{tier_alias}/*"),
            Self::Dir {
                tier_alias,
                dir_index,
            } => write!(f, "{tier_alias}/{dir_index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_belongs_to() {
        let mem0 = BlockStoreLocation::dir("MEM", 0);
        let mem1 = BlockStoreLocation::dir("MEM", 1);
        let mem = BlockStoreLocation::any_dir_in_tier("MEM");
        let ssd = BlockStoreLocation::any_dir_in_tier("SSD");

        assert!(mem0.belongs_to(&mem0));
        assert!(!mem0.belongs_to(&mem1));
        assert!(mem0.belongs_to(&mem));
        assert!(!mem0.belongs_to(&ssd));
        assert!(mem0.belongs_to(&BlockStoreLocation::AnyTier));
        assert!(mem.belongs_to(&BlockStoreLocation::AnyTier));
        assert!(!mem.belongs_to(&mem0));
        assert!(!BlockStoreLocation::AnyTier.belongs_to(&mem));
    }

    #[test]
    fn test_location_display() {
        assert_eq!(BlockStoreLocation::dir("SSD", 2).to_string(), "SSD/2");
        assert_eq!(BlockStoreLocation::any_dir_in_tier("HDD").to_string(), "HDD/*");
        assert_eq!(BlockStoreLocation::AnyTier.to_string(), "any tier");
    }

    #[test]
    fn test_internal_sessions() {
        assert!(SessionId::EVICTOR.is_internal());
        assert!(SessionId::SPACE_RESERVER.is_internal());
        assert!(SessionId::MIGRATE.is_internal());
        assert!(!SessionId::new(33).is_internal());
    }

    #[test]
    fn test_id_conversions() {
        let id: BlockId = 42u64.into();
        assert_eq!(u64::from(id), 42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(format!("{:?}", SessionId::new(7)), "SessionId(7)");
    }
}
