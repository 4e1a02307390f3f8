//! Storage dir: one capacity-bounded location of a tier
//!
//! The capacity counter and the block-id sets of a dir live together behind
//! one mutex, so every reservation, commit and removal is a single critical
//! section and `available = capacity - committed - reserved` holds whenever
//! the lock is free.

use crate::layout;
use crate::meta::{BlockMeta, TempBlockMeta};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use stratus_common::{BlockId, BlockStoreLocation, DirConfig, Error, Result, SessionId};
use tracing::{debug, error, info, warn};

/// Bytes held in a dir ahead of a block landing there
///
/// Produced by [`StorageDir::reserve`] and consumed either by moving a block
/// into the same dir or by [`StorageDir::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation holds capacity until it is used or released"]
pub struct SpaceReservation {
    location: BlockStoreLocation,
    bytes: u64,
}

impl SpaceReservation {
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn location(&self) -> &BlockStoreLocation {
        &self.location
    }
}

/// Point-in-time copy of a dir's accounting
#[derive(Clone, Debug)]
pub struct DirSnapshot {
    pub location: BlockStoreLocation,
    pub capacity_bytes: u64,
    pub available_bytes: u64,
    /// Committed blocks as (id, size)
    pub blocks: Vec<(BlockId, u64)>,
}

/// A single storage dir
pub struct StorageDir {
    tier_alias: String,
    tier_level: usize,
    dir_index: usize,
    path: PathBuf,
    capacity_bytes: u64,
    state: Mutex<DirState>,
}

impl StorageDir {
    /// Open a dir, creating its path and loading the committed blocks found there
    ///
    /// Leftover temporary blocks from a previous run are deleted.
    pub fn open(
        tier_alias: &str,
        tier_level: usize,
        dir_index: usize,
        config: &DirConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let dir = Self::new(tier_alias, tier_level, dir_index, &config.path, config.capacity_bytes);

        let stale = layout::clear_temp_blocks(&config.path)?;
        if stale > 0 {
            warn!(
                "Removed {} stale temporary blocks from {}",
                stale,
                config.path.display()
            );
        }

        let found = layout::scan_committed_blocks(&config.path)?;
        for (block_id, size) in &found {
            let meta = BlockMeta::new(*block_id, *size, &dir);
            if let Err(e) = dir.add_block_meta(meta) {
                error!(
                    "Block {} in {} does not fit the dir capacity: {}",
                    block_id,
                    config.path.display(),
                    e
                );
                return Err(Error::invariant(format!(
                    "existing blocks in {} exceed its capacity of {} bytes",
                    config.path.display(),
                    config.capacity_bytes
                )));
            }
        }

        info!(
            "Opened storage dir {} ({}) with {} blocks, {}/{} bytes available",
            dir.location(),
            config.path.display(),
            found.len(),
            dir.available_bytes(),
            dir.capacity_bytes
        );
        Ok(dir)
    }

    fn new(
        tier_alias: &str,
        tier_level: usize,
        dir_index: usize,
        path: &Path,
        capacity_bytes: u64,
    ) -> Self {
        let location = BlockStoreLocation::dir(tier_alias, dir_index);
        Self {
            tier_alias: tier_alias.to_string(),
            tier_level,
            dir_index,
            path: path.to_path_buf(),
            capacity_bytes,
            state: Mutex::new(DirState::new(location, capacity_bytes)),
        }
    }

    #[must_use]
    pub fn tier_alias(&self) -> &str {
        &self.tier_alias
    }

    #[must_use]
    pub const fn tier_level(&self) -> usize {
        self.tier_level
    }

    #[must_use]
    pub const fn dir_index(&self) -> usize {
        self.dir_index
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Global lock order of dirs: by tier level, then dir index
    #[must_use]
    pub const fn ordinal(&self) -> (usize, usize) {
        (self.tier_level, self.dir_index)
    }

    #[must_use]
    pub fn location(&self) -> BlockStoreLocation {
        BlockStoreLocation::dir(&self.tier_alias, self.dir_index)
    }

    #[must_use]
    pub const fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.state.lock().available_bytes
    }

    /// Capacity minus available: committed plus reserved bytes
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.capacity_bytes - self.available_bytes()
    }

    /// Sum of committed block sizes
    #[must_use]
    pub fn committed_bytes(&self) -> u64 {
        self.state.lock().blocks.values().map(BlockMeta::block_size).sum()
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    #[must_use]
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<_> = self.state.lock().blocks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn temp_block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<_> = self.state.lock().temp_blocks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn has_block(&self, block_id: BlockId) -> bool {
        self.state.lock().blocks.contains_key(&block_id)
    }

    #[must_use]
    pub fn has_temp_block(&self, block_id: BlockId) -> bool {
        self.state.lock().temp_blocks.contains_key(&block_id)
    }

    #[must_use]
    pub fn block_meta(&self, block_id: BlockId) -> Option<BlockMeta> {
        self.state.lock().blocks.get(&block_id).cloned()
    }

    #[must_use]
    pub fn temp_block_meta(&self, block_id: BlockId) -> Option<TempBlockMeta> {
        self.state.lock().temp_blocks.get(&block_id).cloned()
    }

    /// Temporary blocks of one session in this dir
    #[must_use]
    pub fn session_temp_blocks(&self, session_id: SessionId) -> Vec<TempBlockMeta> {
        let state = self.state.lock();
        state
            .session_temp_blocks
            .get(&session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.temp_blocks.get(id).cloned())
            .collect()
    }

    /// Hold `bytes` of capacity; fails without side effects if they are not available
    pub fn reserve(&self, bytes: u64) -> Result<SpaceReservation> {
        let mut state = self.state.lock();
        state.allocate(bytes)?;
        Ok(SpaceReservation {
            location: state.location.clone(),
            bytes,
        })
    }

    /// Return a reservation's bytes to the dir
    pub fn release(&self, reservation: SpaceReservation) -> Result<()> {
        self.state.lock().release(reservation)
    }

    /// Add a committed block, charging its size
    pub fn add_block_meta(&self, meta: BlockMeta) -> Result<()> {
        self.state.lock().insert_block(meta)
    }

    /// Remove a committed block, returning its size to the dir
    pub fn remove_block_meta(&self, block_id: BlockId) -> Result<BlockMeta> {
        self.state.lock().take_block(block_id)
    }

    /// Add a temporary block, reserving its initial size
    pub fn add_temp_block_meta(&self, meta: TempBlockMeta) -> Result<()> {
        self.state.lock().insert_temp(meta)
    }

    /// Change the reservation of a temporary block
    pub fn resize_temp_block_meta(&self, block_id: BlockId, reserved_bytes: u64) -> Result<()> {
        self.state.lock().resize_temp(block_id, reserved_bytes)
    }

    /// Remove a temporary block, returning its reservation to the dir
    pub fn remove_temp_block_meta(&self, block_id: BlockId) -> Result<TempBlockMeta> {
        self.state.lock().take_temp(block_id)
    }

    /// Turn a temporary block into a committed block of `block_size` bytes
    ///
    /// The unused part of the reservation is returned to the dir in the same
    /// critical section.
    pub fn commit_temp_block(&self, block_id: BlockId, block_size: u64) -> Result<BlockMeta> {
        let meta = BlockMeta::new(block_id, block_size, self);
        self.state.lock().commit_temp(meta)
    }

    #[must_use]
    pub fn snapshot(&self) -> DirSnapshot {
        let state = self.state.lock();
        let mut blocks: Vec<_> = state
            .blocks
            .values()
            .map(|m| (m.block_id(), m.block_size()))
            .collect();
        blocks.sort_unstable_by_key(|(id, _)| *id);
        DirSnapshot {
            location: state.location.clone(),
            capacity_bytes: self.capacity_bytes,
            available_bytes: state.available_bytes,
            blocks,
        }
    }

    /// Check the capacity accounting of this dir
    pub fn verify(&self) -> Result<()> {
        self.state.lock().verify()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DirState> {
        self.state.lock()
    }
}

impl std::fmt::Debug for StorageDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDir")
            .field("location", &self.location())
            .field("path", &self.path)
            .field("capacity_bytes", &self.capacity_bytes)
            .finish_non_exhaustive()
    }
}

/// Mutable state of a dir, guarded by the dir mutex
pub(crate) struct DirState {
    location: BlockStoreLocation,
    capacity_bytes: u64,
    available_bytes: u64,
    blocks: HashMap<BlockId, BlockMeta>,
    temp_blocks: HashMap<BlockId, TempBlockMeta>,
    session_temp_blocks: HashMap<SessionId, HashSet<BlockId>>,
}

impl DirState {
    fn new(location: BlockStoreLocation, capacity_bytes: u64) -> Self {
        Self {
            location,
            capacity_bytes,
            available_bytes: capacity_bytes,
            blocks: HashMap::new(),
            temp_blocks: HashMap::new(),
            session_temp_blocks: HashMap::new(),
        }
    }

    pub(crate) fn has_block(&self, block_id: BlockId) -> bool {
        self.blocks.contains_key(&block_id)
    }

    pub(crate) fn has_temp_block(&self, block_id: BlockId) -> bool {
        self.temp_blocks.contains_key(&block_id)
    }

    /// Size check precedes the counter update, so failure leaves no trace
    fn allocate(&mut self, bytes: u64) -> Result<()> {
        if bytes > self.available_bytes {
            return Err(Error::InsufficientSpace {
                location: self.location.clone(),
                required: bytes,
                available: self.available_bytes,
            });
        }
        self.available_bytes -= bytes;
        Ok(())
    }

    fn free(&mut self, bytes: u64) -> Result<()> {
        let available = self.available_bytes.saturating_add(bytes);
        if available > self.capacity_bytes {
            error!(
                "Freeing {} bytes in {} would exceed capacity ({} available of {})",
                bytes, self.location, self.available_bytes, self.capacity_bytes
            );
            return Err(Error::invariant(format!(
                "double free of {bytes} bytes in {}",
                self.location
            )));
        }
        self.available_bytes = available;
        Ok(())
    }

    pub(crate) fn release(&mut self, reservation: SpaceReservation) -> Result<()> {
        self.check_reservation(&reservation)?;
        self.free(reservation.bytes)
    }

    fn check_reservation(&self, reservation: &SpaceReservation) -> Result<()> {
        if reservation.location != self.location {
            return Err(Error::invariant(format!(
                "reservation for {} used in {}",
                reservation.location, self.location
            )));
        }
        Ok(())
    }

    fn check_absent(&self, block_id: BlockId) -> Result<()> {
        if self.blocks.contains_key(&block_id) || self.temp_blocks.contains_key(&block_id) {
            return Err(Error::BlockAlreadyExists { block_id });
        }
        Ok(())
    }

    pub(crate) fn insert_block(&mut self, meta: BlockMeta) -> Result<()> {
        self.check_absent(meta.block_id())?;
        self.allocate(meta.block_size())?;
        self.blocks.insert(meta.block_id(), meta);
        Ok(())
    }

    /// Insert a block whose bytes were reserved earlier
    ///
    /// On failure the reservation is returned to the dir.
    pub(crate) fn insert_reserved_block(
        &mut self,
        meta: BlockMeta,
        reservation: SpaceReservation,
    ) -> Result<()> {
        self.check_reservation(&reservation)?;
        if reservation.bytes != meta.block_size() {
            self.free(reservation.bytes)?;
            return Err(Error::invariant(format!(
                "reservation of {} bytes for block {} of {} bytes",
                reservation.bytes,
                meta.block_id(),
                meta.block_size()
            )));
        }
        if let Err(e) = self.check_absent(meta.block_id()) {
            self.free(reservation.bytes)?;
            return Err(e);
        }
        self.blocks.insert(meta.block_id(), meta);
        Ok(())
    }

    pub(crate) fn take_block(&mut self, block_id: BlockId) -> Result<BlockMeta> {
        let meta = self
            .blocks
            .remove(&block_id)
            .ok_or(Error::BlockNotFound { block_id })?;
        self.free(meta.block_size())?;
        Ok(meta)
    }

    pub(crate) fn insert_temp(&mut self, meta: TempBlockMeta) -> Result<()> {
        self.check_absent(meta.block_id())?;
        self.allocate(meta.reserved_bytes())?;
        self.session_temp_blocks
            .entry(meta.session_id())
            .or_default()
            .insert(meta.block_id());
        self.temp_blocks.insert(meta.block_id(), meta);
        Ok(())
    }

    pub(crate) fn resize_temp(&mut self, block_id: BlockId, reserved_bytes: u64) -> Result<()> {
        let current = self
            .temp_blocks
            .get(&block_id)
            .map(TempBlockMeta::reserved_bytes)
            .ok_or(Error::BlockNotFound { block_id })?;

        if reserved_bytes > current {
            self.allocate(reserved_bytes - current)?;
        } else {
            self.free(current - reserved_bytes)?;
        }
        if let Some(meta) = self.temp_blocks.get_mut(&block_id) {
            meta.set_reserved_bytes(reserved_bytes);
        }
        debug!(
            "Resized temp block {} in {} from {} to {} bytes",
            block_id, self.location, current, reserved_bytes
        );
        Ok(())
    }

    pub(crate) fn take_temp(&mut self, block_id: BlockId) -> Result<TempBlockMeta> {
        let meta = self
            .temp_blocks
            .remove(&block_id)
            .ok_or(Error::BlockNotFound { block_id })?;
        self.forget_session_block(meta.session_id(), block_id);
        self.free(meta.reserved_bytes())?;
        Ok(meta)
    }

    pub(crate) fn take_session_temps(&mut self, session_id: SessionId) -> Result<Vec<TempBlockMeta>> {
        let ids = self
            .session_temp_blocks
            .remove(&session_id)
            .unwrap_or_default();
        let mut removed = Vec::with_capacity(ids.len());
        for block_id in ids {
            if let Some(meta) = self.temp_blocks.remove(&block_id) {
                self.free(meta.reserved_bytes())?;
                removed.push(meta);
            }
        }
        Ok(removed)
    }

    pub(crate) fn commit_temp(&mut self, meta: BlockMeta) -> Result<BlockMeta> {
        let block_id = meta.block_id();
        let reserved = self
            .temp_blocks
            .get(&block_id)
            .map(TempBlockMeta::reserved_bytes)
            .ok_or(Error::BlockNotFound { block_id })?;
        if meta.block_size() > reserved {
            return Err(Error::invalid_state(format!(
                "block {} holds {} bytes but only {} were reserved",
                block_id,
                meta.block_size(),
                reserved
            )));
        }

        if let Some(temp) = self.temp_blocks.remove(&block_id) {
            self.forget_session_block(temp.session_id(), block_id);
        }
        self.free(reserved - meta.block_size())?;
        self.blocks.insert(block_id, meta.clone());
        Ok(meta)
    }

    fn forget_session_block(&mut self, session_id: SessionId, block_id: BlockId) {
        if let Some(ids) = self.session_temp_blocks.get_mut(&session_id) {
            ids.remove(&block_id);
            if ids.is_empty() {
                self.session_temp_blocks.remove(&session_id);
            }
        }
    }

    pub(crate) fn verify(&self) -> Result<()> {
        if self.available_bytes > self.capacity_bytes {
            return Err(Error::invariant(format!(
                "{} has {} bytes available but capacity {}",
                self.location, self.available_bytes, self.capacity_bytes
            )));
        }
        let committed: u64 = self.blocks.values().map(BlockMeta::block_size).sum();
        let reserved: u64 = self.temp_blocks.values().map(TempBlockMeta::reserved_bytes).sum();
        let used = self.capacity_bytes - self.available_bytes;
        if used != committed + reserved {
            return Err(Error::invariant(format!(
                "{} uses {} bytes but holds {} committed and {} reserved",
                self.location, used, committed, reserved
            )));
        }
        Ok(())
    }
}
