//! Block metadata records

use crate::layout;
use crate::meta::StorageDir;
use std::path::PathBuf;
use stratus_common::{BlockId, BlockStoreLocation, SessionId};

/// Metadata of a committed block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    block_id: BlockId,
    block_size: u64,
    location: BlockStoreLocation,
    path: PathBuf,
}

impl BlockMeta {
    /// Create the metadata of a committed block living in `dir`
    #[must_use]
    pub fn new(block_id: BlockId, block_size: u64, dir: &StorageDir) -> Self {
        Self {
            block_id,
            block_size,
            location: dir.location(),
            path: layout::committed_block_path(dir.path(), block_id),
        }
    }

    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block_id
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Location of the block, always a concrete dir
    #[must_use]
    pub fn location(&self) -> &BlockStoreLocation {
        &self.location
    }

    /// Path of the block file
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Metadata of a temporary block owned by one session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempBlockMeta {
    block_id: BlockId,
    session_id: SessionId,
    /// Bytes currently reserved in the dir for this block
    reserved_bytes: u64,
    location: BlockStoreLocation,
    path: PathBuf,
    commit_path: PathBuf,
}

impl TempBlockMeta {
    #[must_use]
    pub fn new(
        session_id: SessionId,
        block_id: BlockId,
        reserved_bytes: u64,
        dir: &StorageDir,
    ) -> Self {
        Self {
            block_id,
            session_id,
            reserved_bytes,
            location: dir.location(),
            path: layout::temp_block_path(dir.path(), session_id, block_id),
            commit_path: layout::committed_block_path(dir.path(), block_id),
        }
    }

    #[must_use]
    pub const fn block_id(&self) -> BlockId {
        self.block_id
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub const fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    pub(crate) fn set_reserved_bytes(&mut self, reserved_bytes: u64) {
        self.reserved_bytes = reserved_bytes;
    }

    #[must_use]
    pub fn location(&self) -> &BlockStoreLocation {
        &self.location
    }

    /// Path the session writes to
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Path the block file is renamed to on commit
    #[must_use]
    pub fn commit_path(&self) -> &PathBuf {
        &self.commit_path
    }
}
