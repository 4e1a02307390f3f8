//! Tiered block store
//!
//! The operation layer of the engine. Every operation follows the same
//! order: block lock, then allocation or eviction, then metadata, then the
//! block file. Metadata changes are made visible before the events that
//! describe them are delivered.
//!
//! Placement hints: `AnyTier` searches every tier from the top. A tier hint
//! starts at that tier and falls through to lower tiers for new blocks, but
//! is strict for moves. A dir hint only ever uses that dir. When nothing in
//! scope has room, the store evicts in the first dir that can be freed
//! enough and tries again, up to `allocation.max_retries` times.

use crate::allocator::{Allocator, create_allocator, scoped_dirs};
use crate::events::BlockStoreEventListener;
use crate::evictor::{Evictor, create_evictor, plan_eviction};
use crate::layout;
use crate::lock::BlockLockManager;
use crate::manager::BlockMetadataManager;
use crate::meta::{BlockMeta, StorageDir, StorageTier, TempBlockMeta};
use crate::stats::StoreStats;
use crate::store_meta::BlockStoreMeta;
use bytes::Bytes;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::sync::Arc;
use stratus_common::{
    BlockId, BlockStoreLocation, Error, LockId, LockMode, Result, SessionId, StoreConfig,
};
use tracing::{debug, error, info, warn};

/// Worker-side block store over a hierarchy of tiers
pub struct TieredBlockStore {
    config: StoreConfig,
    metadata: BlockMetadataManager,
    locks: BlockLockManager,
    allocator: Arc<dyn Allocator>,
    evictor: Arc<dyn Evictor>,
    listeners: RwLock<Vec<Arc<dyn BlockStoreEventListener>>>,
    stats: StoreStats,
}

impl TieredBlockStore {
    /// Open the store, loading the blocks already present in its dirs
    pub fn open(config: StoreConfig) -> Result<Self> {
        let metadata = BlockMetadataManager::open(&config)?;
        let locks = BlockLockManager::new(config.lock.timeout());
        let allocator = create_allocator(config.allocation.policy);
        let evictor = create_evictor(config.eviction.policy);
        let evictor_listener: Arc<dyn BlockStoreEventListener> = evictor.clone();

        info!(
            "Tiered block store opened: {} tiers, {} bytes, {} blocks, allocator={}, evictor={}",
            metadata.tiers().len(),
            config.total_capacity_bytes(),
            metadata.block_count(),
            allocator.name(),
            evictor.name()
        );

        Ok(Self {
            config,
            metadata,
            locks,
            allocator,
            evictor,
            listeners: RwLock::new(vec![evictor_listener]),
            stats: StoreStats::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn metadata(&self) -> &BlockMetadataManager {
        &self.metadata
    }

    #[must_use]
    pub fn lock_manager(&self) -> &BlockLockManager {
        &self.locks
    }

    #[must_use]
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    #[must_use]
    pub fn tiers(&self) -> &[Arc<StorageTier>] {
        self.metadata.tiers()
    }

    /// Add an observer of block events
    pub fn register_listener(&self, listener: Arc<dyn BlockStoreEventListener>) {
        self.listeners.write().push(listener);
    }

    fn emit(&self, event: impl Fn(&dyn BlockStoreEventListener)) {
        for listener in self.listeners.read().iter() {
            event(listener.as_ref());
        }
    }

    #[must_use]
    pub fn has_block(&self, block_id: BlockId) -> bool {
        self.metadata.has_block_meta(block_id)
    }

    pub fn block_meta(&self, block_id: BlockId) -> Result<BlockMeta> {
        self.metadata.block_meta(block_id)
    }

    pub fn temp_block_meta(&self, block_id: BlockId) -> Result<TempBlockMeta> {
        self.metadata.temp_block_meta(block_id)
    }

    /// Capacity report of the store
    #[must_use]
    pub fn block_store_meta(&self) -> BlockStoreMeta {
        BlockStoreMeta::new(&self.metadata)
    }

    /// Capacity report including the block ids of every tier
    #[must_use]
    pub fn block_store_meta_full(&self) -> BlockStoreMeta {
        BlockStoreMeta::new_full(&self.metadata)
    }

    /// Check the accounting of every dir and the block indexes
    ///
    /// The cross-index check needs a quiescent store; see [`Self::check_accounting`]
    /// for a check that is safe under load.
    pub fn verify(&self) -> Result<()> {
        self.metadata.verify()
    }

    /// Check each dir's capacity accounting, one dir mutex at a time
    pub fn check_accounting(&self) -> Result<()> {
        self.metadata.dirs().try_for_each(|dir| dir.verify())
    }

    // Block lifecycle

    /// Create a temporary block owned by `session_id`, reserving `initial_bytes`
    pub fn create_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        hint: &BlockStoreLocation,
        initial_bytes: u64,
    ) -> Result<TempBlockMeta> {
        self.metadata.check_location(hint)?;
        if self.metadata.has_block_meta(block_id) || self.metadata.has_temp_block_meta(block_id) {
            return Err(Error::BlockAlreadyExists { block_id });
        }

        let scopes = self.creation_scopes(hint)?;
        let meta = self.allocate(initial_bytes, hint, &scopes, |dir| {
            let meta = TempBlockMeta::new(session_id, block_id, initial_bytes, dir);
            self.metadata.add_temp_block_meta(dir, meta.clone())?;
            Ok(meta)
        })?;

        if let Err(e) = layout::create_empty_file(meta.path()) {
            error!("Failed to create file for temp block {}: {}", block_id, e);
            self.metadata.abort_temp_block_meta(block_id)?;
            return Err(e);
        }

        StoreStats::incr(&self.stats.blocks_created);
        debug!(
            "Session {} created block {} in {} with {} bytes reserved",
            session_id,
            block_id,
            meta.location(),
            initial_bytes
        );
        Ok(meta)
    }

    /// Grow the reservation of a temporary block by `additional_bytes`
    ///
    /// Evicts in the block's dir if it lacks room. Temporary blocks never
    /// change dir.
    pub fn request_space(&self, session_id: SessionId, block_id: BlockId, additional_bytes: u64) -> Result<()> {
        let meta = self.owned_temp_block(session_id, block_id)?;
        if additional_bytes == 0 {
            return Ok(());
        }
        let target = meta.reserved_bytes().checked_add(additional_bytes).ok_or_else(|| {
            Error::invalid_argument(format!("block {block_id} cannot grow by {additional_bytes} bytes"))
        })?;

        for attempt in 0..=self.config.allocation.max_retries {
            match self.metadata.resize_temp_block_meta(block_id, target) {
                Ok(()) => return Ok(()),
                Err(Error::InsufficientSpace { .. }) => {}
                Err(e) => return Err(e),
            }

            let dir = self.dir_of(meta.location())?;
            debug!(
                "Block {} needs {} more bytes in {}, evicting (attempt {})",
                block_id,
                additional_bytes,
                dir.location(),
                attempt + 1
            );
            match self.free_space_in_dir(&dir, additional_bytes) {
                Ok(_) => {}
                Err(e @ Error::CannotFreeSpace { .. }) => {
                    debug!("Eviction in {} failed: {}", dir.location(), e);
                    break;
                }
                Err(e) => {
                    error!("Eviction in {} for block {} failed: {}", dir.location(), block_id, e);
                    return Err(e);
                }
            }
        }

        StoreStats::incr(&self.stats.allocation_failures);
        Err(Error::NoSpaceAvailable {
            location: meta.location().clone(),
            required: additional_bytes,
        })
    }

    /// Write `data` at `offset` of a temporary block, growing its reservation if needed
    pub fn write_block(&self, session_id: SessionId, block_id: BlockId, offset: u64, data: &[u8]) -> Result<()> {
        let meta = self.owned_temp_block(session_id, block_id)?;
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            Error::invalid_argument(format!(
                "write of {} bytes at offset {offset} overflows block {block_id}",
                data.len()
            ))
        })?;
        if end > meta.reserved_bytes() {
            self.request_space(session_id, block_id, end - meta.reserved_bytes())?;
        }
        layout::write_at(meta.path(), offset, data)
    }

    /// Commit a temporary block at its written size
    ///
    /// The unused part of the reservation goes back to the dir.
    pub fn commit_block(&self, session_id: SessionId, block_id: BlockId) -> Result<BlockMeta> {
        let temp = self.owned_temp_block(session_id, block_id)?;
        let lock_id = self.lock(block_id, session_id, LockMode::Write)?;
        let result = self.commit_locked(&temp);
        self.release(lock_id);
        let meta = result?;

        if let Some(session_dir) = temp.path().parent() {
            layout::remove_dir_if_empty(session_dir);
        }
        StoreStats::incr(&self.stats.blocks_committed);
        self.emit(|l| l.on_commit_block(session_id, block_id, meta.location()));
        debug!(
            "Session {} committed block {} ({} bytes) in {}",
            session_id,
            block_id,
            meta.block_size(),
            meta.location()
        );
        Ok(meta)
    }

    fn commit_locked(&self, temp: &TempBlockMeta) -> Result<BlockMeta> {
        let block_id = temp.block_id();
        let size = layout::file_len(temp.path())?;
        if size > temp.reserved_bytes() {
            return Err(Error::invalid_state(format!(
                "block {} has {} bytes written but only {} reserved",
                block_id,
                size,
                temp.reserved_bytes()
            )));
        }

        layout::rename(temp.path(), temp.commit_path())?;
        self.metadata
            .commit_temp_block_meta(block_id, size)
            .inspect_err(|_| {
                if let Err(e) = layout::rename(temp.commit_path(), temp.path()) {
                    error!("Failed to roll back commit of block {}: {}", block_id, e);
                }
            })
    }

    /// Drop a temporary block and its reservation
    pub fn abort_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        self.owned_temp_block(session_id, block_id)?;
        let lock_id = self.lock(block_id, session_id, LockMode::Write)?;
        let result = self.metadata.abort_temp_block_meta(block_id);
        self.release(lock_id);
        let meta = result?;

        self.remove_temp_file(&meta);
        StoreStats::incr(&self.stats.blocks_aborted);
        self.emit(|l| l.on_abort_block(session_id, block_id));
        debug!("Session {} aborted block {}", session_id, block_id);
        Ok(())
    }

    fn remove_temp_file(&self, meta: &TempBlockMeta) {
        if let Err(e) = layout::remove_file_if_exists(meta.path()) {
            warn!("Failed to delete temp block file {}: {}", meta.path().display(), e);
        }
        if let Some(session_dir) = meta.path().parent() {
            layout::remove_dir_if_empty(session_dir);
        }
    }

    // Locks and reads

    /// Lock a committed block, waiting up to the configured timeout
    ///
    /// Fails `BlockNotFound` (with the lock released) if the block does not
    /// exist once the lock is held.
    pub fn lock_block(&self, session_id: SessionId, block_id: BlockId, mode: LockMode) -> Result<LockId> {
        let lock_id = self.lock(block_id, session_id, mode)?;
        self.ensure_committed(block_id, lock_id)
    }

    /// Lock a committed block only if it can be granted right away
    pub fn try_lock_block(&self, session_id: SessionId, block_id: BlockId, mode: LockMode) -> Result<LockId> {
        let lock_id = self.locks.try_lock(block_id, session_id, mode)?;
        self.ensure_committed(block_id, lock_id)
    }

    fn ensure_committed(&self, block_id: BlockId, lock_id: LockId) -> Result<LockId> {
        if self.metadata.has_block_meta(block_id) {
            Ok(lock_id)
        } else {
            self.release(lock_id);
            Err(Error::BlockNotFound { block_id })
        }
    }

    pub fn unlock_block(&self, lock_id: LockId) -> Result<()> {
        self.locks.unlock(lock_id)
    }

    /// Read a committed block under a lock held by `session_id`
    pub fn read_block(&self, session_id: SessionId, block_id: BlockId, lock_id: LockId) -> Result<Bytes> {
        self.locks.validate_lock(session_id, block_id, lock_id)?;
        let meta = self.metadata.block_meta(block_id)?;
        layout::read_file(meta.path())
    }

    /// Record an access, feeding access-ordered eviction
    pub fn access_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        if !self.metadata.has_block_meta(block_id) {
            return Err(Error::BlockNotFound { block_id });
        }
        self.emit(|l| l.on_access_block(session_id, block_id));
        Ok(())
    }

    // Placement changes

    /// Move a committed block into `location`
    ///
    /// A block already inside `location` is left where it is. The target is
    /// strict: no fall-through to other tiers.
    pub fn move_block(&self, session_id: SessionId, block_id: BlockId, location: &BlockStoreLocation) -> Result<BlockMeta> {
        self.metadata.check_location(location)?;
        if self.metadata.has_temp_block_meta(block_id) {
            return Err(Error::invalid_state(format!("block {block_id} is not committed")));
        }

        let lock_id = self.lock(block_id, session_id, LockMode::Write)?;
        let result = self.move_locked(session_id, block_id, location);
        self.release(lock_id);
        result
    }

    fn move_locked(&self, session_id: SessionId, block_id: BlockId, location: &BlockStoreLocation) -> Result<BlockMeta> {
        let meta = self.metadata.block_meta(block_id)?;
        if meta.location().belongs_to(location) {
            return Ok(meta);
        }

        let size = meta.block_size();
        let scopes = [location.clone()];
        let (dir, reservation) = self.allocate(size, location, &scopes, |dir| {
            dir.reserve(size).map(|r| (Arc::clone(dir), r))
        })?;

        let dst = layout::committed_block_path(dir.path(), block_id);
        if let Err(e) = layout::copy_file(meta.path(), &dst) {
            dir.release(reservation)?;
            discard_copy(&dst);
            return Err(e);
        }

        let moved = match self.metadata.move_block_meta(block_id, &dir, reservation) {
            Ok(moved) => moved,
            Err(e) => {
                discard_copy(&dst);
                return Err(e);
            }
        };
        if let Err(e) = layout::remove_file_if_exists(meta.path()) {
            warn!("Failed to delete old copy of block {}: {}", block_id, e);
        }

        StoreStats::incr(&self.stats.blocks_moved);
        self.emit(|l| l.on_move_block(session_id, block_id, meta.location(), moved.location()));
        debug!(
            "Session {} moved block {} from {} to {}",
            session_id,
            block_id,
            meta.location(),
            moved.location()
        );
        Ok(moved)
    }

    /// Remove a committed block
    ///
    /// Fails `BlockInUse` if another session holds a lock on it.
    pub fn remove_block(&self, session_id: SessionId, block_id: BlockId) -> Result<()> {
        if self.metadata.has_temp_block_meta(block_id) {
            return Err(Error::invalid_state(format!("block {block_id} is not committed")));
        }
        if !self.metadata.has_block_meta(block_id) {
            return Err(Error::BlockNotFound { block_id });
        }

        let lock_id = self.locks.try_lock(block_id, session_id, LockMode::Write)?;
        let result = self.metadata.remove_block_meta(block_id);
        self.release(lock_id);
        let meta = result?;

        if let Err(e) = layout::remove_file_if_exists(meta.path()) {
            warn!("Failed to delete file of removed block {}: {}", block_id, e);
        }
        StoreStats::incr(&self.stats.blocks_removed);
        self.emit(|l| l.on_remove_block(session_id, block_id));
        debug!("Session {} removed block {}", session_id, block_id);
        Ok(())
    }

    // Eviction

    /// Make `bytes` available in `location` by evicting, returning the victims
    ///
    /// For a tier or any-tier location it is enough that one dir in scope
    /// ends up with `bytes` available.
    pub fn free_space(&self, session_id: SessionId, bytes: u64, location: &BlockStoreLocation) -> Result<Vec<BlockId>> {
        self.metadata.check_location(location)?;
        let (dir, evicted) = self.make_room(bytes, location)?;
        if !evicted.is_empty() {
            info!(
                "Session {} freed {} bytes in {} by evicting {} blocks",
                session_id,
                bytes,
                dir.location(),
                evicted.len()
            );
        }
        Ok(evicted)
    }

    /// Dirs of `scope` in eviction preference: tier order, most available first
    fn eviction_candidates(&self, scope: &BlockStoreLocation) -> Vec<Arc<StorageDir>> {
        scoped_dirs(self.metadata.tiers(), scope)
            .into_iter()
            .flat_map(|(_, dirs)| {
                let mut dirs = dirs.to_vec();
                dirs.sort_by_key(|d| (Reverse(d.available_bytes()), d.dir_index()));
                dirs
            })
            .collect()
    }

    /// Find or free a dir in `scope` with `bytes` available
    fn make_room(&self, bytes: u64, scope: &BlockStoreLocation) -> Result<(Arc<StorageDir>, Vec<BlockId>)> {
        let candidates = self.eviction_candidates(scope);
        if let Some(dir) = candidates.iter().find(|d| d.available_bytes() >= bytes) {
            return Ok((Arc::clone(dir), Vec::new()));
        }

        for dir in candidates {
            if dir.capacity_bytes() < bytes {
                continue;
            }
            match self.free_space_in_dir(&dir, bytes) {
                Ok(evicted) => return Ok((dir, evicted)),
                Err(Error::CannotFreeSpace { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Err(Error::CannotFreeSpace {
            location: scope.clone(),
            required: bytes,
        })
    }

    /// Evict from one dir until it has `bytes` available
    ///
    /// Only blocks nobody holds a lock on are candidates, unless
    /// `eviction.evict_read_locked` is set, in which case blocks with only
    /// readers are too. Nothing is touched when the candidates cannot cover
    /// the request.
    fn free_space_in_dir(&self, dir: &Arc<StorageDir>, bytes: u64) -> Result<Vec<BlockId>> {
        let revoke_readers = self.config.eviction.evict_read_locked;
        let snapshot = dir.snapshot();
        let plan = plan_eviction(self.evictor.as_ref(), &snapshot, bytes, |id| {
            if revoke_readers {
                !self.locks.has_writer(id)
            } else {
                !self.locks.is_locked(id)
            }
        })
        .ok_or_else(|| Error::CannotFreeSpace {
            location: dir.location(),
            required: bytes,
        })?;

        let mut evicted = Vec::new();
        for (block_id, _) in plan {
            if dir.available_bytes() >= bytes {
                break;
            }
            let Some(lock_id) = self.locks.try_lock_for_eviction(block_id, revoke_readers) else {
                continue;
            };
            let result = self.evict_locked(dir, block_id);
            self.release(lock_id);
            match result {
                Ok(true) => evicted.push(block_id),
                Ok(false) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if dir.available_bytes() < bytes {
            return Err(Error::CannotFreeSpace {
                location: dir.location(),
                required: bytes,
            });
        }
        Ok(evicted)
    }

    /// Demote or delete one block held by the evictor; false if it already left the dir
    fn evict_locked(&self, dir: &Arc<StorageDir>, block_id: BlockId) -> Result<bool> {
        let Some(meta) = dir.block_meta(block_id) else {
            return Ok(false);
        };

        if self.config.eviction.cascade && self.demote(dir, &meta)? {
            return Ok(true);
        }

        let removed = self.metadata.remove_block_meta(block_id)?;
        if let Err(e) = layout::remove_file_if_exists(removed.path()) {
            warn!("Failed to delete file of evicted block {}: {}", block_id, e);
        }
        StoreStats::incr(&self.stats.blocks_evicted);
        StoreStats::add(&self.stats.bytes_evicted, removed.block_size());
        self.emit(|l| l.on_evict_block(block_id, removed.location()));
        debug!("Evicted block {} ({} bytes) from {}", block_id, removed.block_size(), removed.location());
        Ok(true)
    }

    /// Move a victim into the next tier if a dir there has room; never evicts there
    fn demote(&self, dir: &Arc<StorageDir>, meta: &BlockMeta) -> Result<bool> {
        let Some(next) = self.metadata.next_tier(dir.tier_level()) else {
            return Ok(false);
        };
        let scope = BlockStoreLocation::any_dir_in_tier(next.alias());
        let size = meta.block_size();
        let Some(target) = self.allocator.select_dir(self.metadata.tiers(), size, &scope) else {
            return Ok(false);
        };
        let Ok(reservation) = target.reserve(size) else {
            return Ok(false);
        };

        let block_id = meta.block_id();
        let dst = layout::committed_block_path(target.path(), block_id);
        if let Err(e) = layout::copy_file(meta.path(), &dst) {
            warn!("Failed to copy block {} to {}: {}", block_id, target.location(), e);
            target.release(reservation)?;
            discard_copy(&dst);
            return Ok(false);
        }
        let moved = match self.metadata.move_block_meta(block_id, &target, reservation) {
            Ok(moved) => moved,
            Err(e) => {
                discard_copy(&dst);
                return Err(e);
            }
        };
        if let Err(e) = layout::remove_file_if_exists(meta.path()) {
            warn!("Failed to delete old copy of block {}: {}", block_id, e);
        }

        StoreStats::incr(&self.stats.blocks_demoted);
        StoreStats::add(&self.stats.bytes_evicted, size);
        self.emit(|l| l.on_move_block(SessionId::MIGRATE, block_id, meta.location(), moved.location()));
        debug!("Demoted block {} from {} to {}", block_id, meta.location(), moved.location());
        Ok(true)
    }

    // Sessions

    /// Release every lock and temporary block of a session
    pub fn cleanup_session(&self, session_id: SessionId) -> Result<()> {
        let released = self.locks.cleanup_session(session_id);
        let removed = self.metadata.cleanup_session_temp_blocks(session_id)?;

        for meta in &removed {
            self.remove_temp_file(meta);
            self.emit(|l| l.on_abort_block(session_id, meta.block_id()));
        }
        for dir in self.metadata.dirs() {
            layout::remove_dir_if_empty(&layout::session_temp_dir(dir.path(), session_id));
        }
        StoreStats::add(&self.stats.blocks_aborted, removed.len() as u64);

        if released > 0 || !removed.is_empty() {
            info!(
                "Cleaned up session {}: {} locks released, {} temp blocks removed",
                session_id,
                released,
                removed.len()
            );
        }
        Ok(())
    }

    // Helpers

    fn lock(&self, block_id: BlockId, session_id: SessionId, mode: LockMode) -> Result<LockId> {
        self.locks.lock(block_id, session_id, mode).inspect_err(|e| {
            if matches!(e, Error::Timeout(_)) {
                StoreStats::incr(&self.stats.lock_timeouts);
            }
        })
    }

    fn release(&self, lock_id: LockId) {
        // Revoked or already cleaned up with its session
        if let Err(e) = self.locks.unlock(lock_id) {
            debug!("Lock {} was already released: {}", lock_id, e);
        }
    }

    fn owned_temp_block(&self, session_id: SessionId, block_id: BlockId) -> Result<TempBlockMeta> {
        let meta = self.metadata.temp_block_meta(block_id)?;
        if meta.session_id() != session_id {
            return Err(Error::invalid_state(format!(
                "temp block {} belongs to session {}, not {}",
                block_id,
                meta.session_id(),
                session_id
            )));
        }
        Ok(meta)
    }

    fn dir_of(&self, location: &BlockStoreLocation) -> Result<Arc<StorageDir>> {
        match location {
            BlockStoreLocation::Dir {
                tier_alias,
                dir_index,
            } => self.metadata.dir(tier_alias, *dir_index),
            other => Err(Error::invariant(format!("{other} is not a dir"))),
        }
    }

    /// Search order for new blocks: tier hints fall through to lower tiers
    fn creation_scopes(&self, hint: &BlockStoreLocation) -> Result<Vec<BlockStoreLocation>> {
        match hint {
            BlockStoreLocation::AnyDirInTier { tier_alias } => {
                let level = self.metadata.tier(tier_alias)?.level();
                Ok(self.metadata.tiers()[level..]
                    .iter()
                    .map(|t| BlockStoreLocation::any_dir_in_tier(t.alias()))
                    .collect())
            }
            other => Ok(vec![other.clone()]),
        }
    }

    /// Find a dir for `bytes` and run `place` on it
    ///
    /// `place` reserves the bytes; `InsufficientSpace` from it means another
    /// allocation won the race and the search continues.
    fn allocate<T>(
        &self,
        bytes: u64,
        hint: &BlockStoreLocation,
        scopes: &[BlockStoreLocation],
        mut place: impl FnMut(&Arc<StorageDir>) -> Result<T>,
    ) -> Result<T> {
        for attempt in 0..=self.config.allocation.max_retries {
            for scope in scopes {
                let Some(dir) = self.allocator.select_dir(self.metadata.tiers(), bytes, scope) else {
                    continue;
                };
                match place(&dir) {
                    Ok(placed) => return Ok(placed),
                    Err(Error::InsufficientSpace { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            let mut freed = None;
            for scope in scopes {
                match self.make_room(bytes, scope) {
                    Ok((dir, _)) => {
                        freed = Some(dir);
                        break;
                    }
                    Err(Error::CannotFreeSpace { .. }) => {}
                    Err(e) => {
                        error!("Eviction in {} for {} bytes failed: {}", scope, bytes, e);
                        return Err(e);
                    }
                }
            }
            let Some(dir) = freed else {
                break;
            };
            match place(&dir) {
                Ok(placed) => return Ok(placed),
                Err(Error::InsufficientSpace { .. }) => {
                    debug!("Lost freed space in {} to another allocation (attempt {})", dir.location(), attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }

        StoreStats::incr(&self.stats.allocation_failures);
        Err(Error::NoSpaceAvailable {
            location: hint.clone(),
            required: bytes,
        })
    }
}

/// Delete a copy that never became the block's home
fn discard_copy(path: &std::path::Path) {
    if let Err(e) = layout::remove_file_if_exists(path) {
        warn!("Failed to delete stale copy {}: {}", path.display(), e);
    }
}
