//! Block store events

use stratus_common::{BlockId, BlockStoreLocation, SessionId};

/// Observer of block placement changes
///
/// Called after the change is visible in the metadata, outside any dir
/// mutex. Implementations must not call back into the store.
pub trait BlockStoreEventListener: Send + Sync {
    fn on_commit_block(&self, _session_id: SessionId, _block_id: BlockId, _location: &BlockStoreLocation) {}

    fn on_abort_block(&self, _session_id: SessionId, _block_id: BlockId) {}

    fn on_access_block(&self, _session_id: SessionId, _block_id: BlockId) {}

    fn on_move_block(
        &self,
        _session_id: SessionId,
        _block_id: BlockId,
        _from: &BlockStoreLocation,
        _to: &BlockStoreLocation,
    ) {
    }

    fn on_remove_block(&self, _session_id: SessionId, _block_id: BlockId) {}

    /// A block was removed or demoted to make room
    fn on_evict_block(&self, _block_id: BlockId, _from: &BlockStoreLocation) {}
}
