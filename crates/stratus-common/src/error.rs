//! Error types for Stratus
//!
//! This module defines the common error type used throughout the store.

use crate::types::{BlockId, BlockStoreLocation, LockId, SessionId};
use std::time::Duration;
use thiserror::Error;

/// Common result type for Stratus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Stratus
#[derive(Debug, Error)]
pub enum Error {
    // Block errors
    #[error("block not found: {block_id}")]
    BlockNotFound { block_id: BlockId },

    #[error("block already exists: {block_id}")]
    BlockAlreadyExists { block_id: BlockId },

    #[error("block {block_id} is in use by another session")]
    BlockInUse { block_id: BlockId },

    // Capacity errors
    #[error("insufficient space in {location}: required {required} bytes, available {available} bytes")]
    InsufficientSpace {
        location: BlockStoreLocation,
        required: u64,
        available: u64,
    },

    #[error("no space available for {required} bytes in {location}")]
    NoSpaceAvailable {
        location: BlockStoreLocation,
        required: u64,
    },

    #[error("cannot free {required} bytes in {location}: not enough evictable blocks")]
    CannotFreeSpace {
        location: BlockStoreLocation,
        required: u64,
    },

    // Structure errors
    #[error("tier not found: {0}")]
    TierNotFound(String),

    #[error("dir not found: {tier_alias}/{dir_index}")]
    DirNotFound { tier_alias: String, dir_index: usize },

    // Lock errors
    #[error("lock not found: {0}")]
    LockNotFound(LockId),

    #[error("lock {lock_id} is not held by session {session_id} on block {block_id}")]
    InvalidLock {
        lock_id: LockId,
        session_id: SessionId,
        block_id: BlockId,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    // State errors
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // I/O and setup
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// Lock timeouts and in-use conflicts clear up once the holder finishes;
    /// capacity errors may clear up after eviction or removals.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::BlockInUse { .. }
                | Self::NoSpaceAvailable { .. }
                | Self::InsufficientSpace { .. }
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BlockNotFound { .. }
                | Self::TierNotFound(_)
                | Self::DirNotFound { .. }
                | Self::LockNotFound(_)
        )
    }

    /// Internal consistency failures; never retried
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::BlockInUse {
            block_id: BlockId::new(1)
        }
        .is_retryable());
        assert!(!Error::invariant("double free").is_retryable());
        assert!(!Error::BlockNotFound {
            block_id: BlockId::new(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::BlockNotFound {
            block_id: BlockId::new(9)
        }
        .is_not_found());
        assert!(Error::TierNotFound("NVME".into()).is_not_found());
        assert!(!Error::Timeout(Duration::ZERO).is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::NoSpaceAvailable {
            location: BlockStoreLocation::dir("MEM", 0),
            required: 6000,
        };
        assert_eq!(err.to_string(), "no space available for 6000 bytes in MEM/0");
        assert!(Error::invariant("x").is_fatal());
    }
}
