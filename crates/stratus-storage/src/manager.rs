//! Block metadata manager
//!
//! Owns the tiers and the block indexes of a store. Each block id maps to the
//! dir that holds it, committed and temporary blocks in separate indexes.
//!
//! Lock order: dir mutexes first (by tier level, then dir index), then the
//! index shards. Index entries are cloned out before any dir is locked, and a
//! dir lookup is re-checked after locking because a concurrent move may have
//! redirected the block.

use crate::layout;
use crate::meta::{BlockMeta, SpaceReservation, StorageDir, StorageTier, TempBlockMeta};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use stratus_common::{BlockId, BlockStoreLocation, Error, Result, SessionId, StoreConfig};
use tracing::{debug, info, warn};

/// Metadata of all tiers, dirs and blocks of a store
pub struct BlockMetadataManager {
    tiers: Vec<Arc<StorageTier>>,
    alias_index: HashMap<String, usize>,
    blocks: DashMap<BlockId, Arc<StorageDir>>,
    temp_blocks: DashMap<BlockId, Arc<StorageDir>>,
}

impl BlockMetadataManager {
    /// Open all tiers of `config` and index the blocks found on disk
    ///
    /// A block id present in more than one dir is kept in the first dir in
    /// tier order; later copies are deleted.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let tiers = config
            .tiers
            .iter()
            .enumerate()
            .map(|(level, tier)| StorageTier::open(tier, level).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let alias_index = tiers
            .iter()
            .map(|t| (t.alias().to_string(), t.level()))
            .collect();

        let manager = Self {
            tiers,
            alias_index,
            blocks: DashMap::new(),
            temp_blocks: DashMap::new(),
        };

        for dir in manager.dirs() {
            for block_id in dir.block_ids() {
                if let Some(first) = manager.block_dir(block_id) {
                    warn!(
                        "Block {} found in both {} and {}, dropping the copy in {}",
                        block_id,
                        first.location(),
                        dir.location(),
                        dir.location()
                    );
                    let meta = dir.remove_block_meta(block_id)?;
                    layout::remove_file_if_exists(meta.path())?;
                    continue;
                }
                manager.blocks.insert(block_id, Arc::clone(&dir));
            }
        }

        info!(
            "Block metadata loaded: {} tiers, {} blocks",
            manager.tiers.len(),
            manager.blocks.len()
        );
        Ok(manager)
    }

    /// Tiers in level order
    #[must_use]
    pub fn tiers(&self) -> &[Arc<StorageTier>] {
        &self.tiers
    }

    pub fn tier(&self, alias: &str) -> Result<&Arc<StorageTier>> {
        self.alias_index
            .get(alias)
            .map(|level| &self.tiers[*level])
            .ok_or_else(|| Error::TierNotFound(alias.to_string()))
    }

    /// Tier one level below `level`, if any
    #[must_use]
    pub fn next_tier(&self, level: usize) -> Option<&Arc<StorageTier>> {
        self.tiers.get(level + 1)
    }

    pub fn dir(&self, tier_alias: &str, dir_index: usize) -> Result<Arc<StorageDir>> {
        self.tier(tier_alias)?.dir(dir_index).cloned()
    }

    /// All dirs in lock order
    pub fn dirs(&self) -> impl Iterator<Item = Arc<StorageDir>> + '_ {
        self.tiers.iter().flat_map(|t| t.dirs().iter().cloned())
    }

    /// Check that every tier and dir named by `location` exists
    pub fn check_location(&self, location: &BlockStoreLocation) -> Result<()> {
        match location {
            BlockStoreLocation::AnyTier => Ok(()),
            BlockStoreLocation::AnyDirInTier { tier_alias } => self.tier(tier_alias).map(|_| ()),
            BlockStoreLocation::Dir {
                tier_alias,
                dir_index,
            } => self.dir(tier_alias, *dir_index).map(|_| ()),
        }
    }

    #[must_use]
    pub fn has_block_meta(&self, block_id: BlockId) -> bool {
        self.blocks.contains_key(&block_id)
    }

    #[must_use]
    pub fn has_temp_block_meta(&self, block_id: BlockId) -> bool {
        self.temp_blocks.contains_key(&block_id)
    }

    fn block_dir(&self, block_id: BlockId) -> Option<Arc<StorageDir>> {
        self.blocks.get(&block_id).map(|d| Arc::clone(d.value()))
    }

    fn temp_block_dir(&self, block_id: BlockId) -> Option<Arc<StorageDir>> {
        self.temp_blocks.get(&block_id).map(|d| Arc::clone(d.value()))
    }

    pub fn block_meta(&self, block_id: BlockId) -> Result<BlockMeta> {
        loop {
            let dir = self
                .block_dir(block_id)
                .ok_or(Error::BlockNotFound { block_id })?;
            if let Some(meta) = dir.block_meta(block_id) {
                return Ok(meta);
            }
            // Moved or removed between the lookup and the dir read
            if self
                .block_dir(block_id)
                .is_none_or(|current| Arc::ptr_eq(&current, &dir))
            {
                return Err(Error::BlockNotFound { block_id });
            }
        }
    }

    /// Dir currently holding a committed block
    pub fn block_location(&self, block_id: BlockId) -> Result<BlockStoreLocation> {
        self.block_meta(block_id).map(|meta| meta.location().clone())
    }

    pub fn temp_block_meta(&self, block_id: BlockId) -> Result<TempBlockMeta> {
        self.temp_block_dir(block_id)
            .and_then(|dir| dir.temp_block_meta(block_id))
            .ok_or(Error::BlockNotFound { block_id })
    }

    /// Register a temporary block in `dir`, reserving its initial size there
    pub fn add_temp_block_meta(&self, dir: &Arc<StorageDir>, meta: TempBlockMeta) -> Result<()> {
        let block_id = meta.block_id();
        let mut state = dir.lock_state();
        match self.temp_blocks.entry(block_id) {
            Entry::Occupied(_) => Err(Error::BlockAlreadyExists { block_id }),
            Entry::Vacant(entry) => {
                if self.blocks.contains_key(&block_id) {
                    return Err(Error::BlockAlreadyExists { block_id });
                }
                state.insert_temp(meta)?;
                entry.insert(Arc::clone(dir));
                Ok(())
            }
        }
    }

    pub fn resize_temp_block_meta(&self, block_id: BlockId, reserved_bytes: u64) -> Result<()> {
        let dir = self
            .temp_block_dir(block_id)
            .ok_or(Error::BlockNotFound { block_id })?;
        dir.resize_temp_block_meta(block_id, reserved_bytes)
    }

    /// Turn a temporary block into a committed block of `block_size` bytes
    pub fn commit_temp_block_meta(&self, block_id: BlockId, block_size: u64) -> Result<BlockMeta> {
        let dir = self
            .temp_block_dir(block_id)
            .ok_or(Error::BlockNotFound { block_id })?;
        let committed = BlockMeta::new(block_id, block_size, &dir);

        let mut state = dir.lock_state();
        let meta = state.commit_temp(committed)?;
        // Committed entry first: the id must stay visible in one index or
        // the other, or a concurrent create could claim it in another dir
        self.blocks.insert(block_id, Arc::clone(&dir));
        self.temp_blocks.remove(&block_id);
        drop(state);

        debug!("Committed block {} ({} bytes) in {}", block_id, block_size, dir.location());
        Ok(meta)
    }

    /// Drop a temporary block, returning its reservation
    pub fn abort_temp_block_meta(&self, block_id: BlockId) -> Result<TempBlockMeta> {
        let dir = self
            .temp_block_dir(block_id)
            .ok_or(Error::BlockNotFound { block_id })?;

        let mut state = dir.lock_state();
        let meta = state.take_temp(block_id)?;
        self.temp_blocks.remove(&block_id);
        Ok(meta)
    }

    /// Point a committed block at `to`, using bytes reserved there beforehand
    ///
    /// Both dirs are updated under their locks, taken in lock order, so the
    /// block is never visible in two dirs or in none. The reservation is
    /// returned to `to` if the move does not happen.
    pub fn move_block_meta(
        &self,
        block_id: BlockId,
        to: &Arc<StorageDir>,
        reservation: SpaceReservation,
    ) -> Result<BlockMeta> {
        let Some(from) = self.block_dir(block_id) else {
            to.release(reservation)?;
            return Err(Error::BlockNotFound { block_id });
        };
        if Arc::ptr_eq(&from, to) {
            to.release(reservation)?;
            return Err(Error::invalid_state(format!(
                "block {block_id} is already in {}",
                to.location()
            )));
        }

        let moved = {
            let (mut from_state, mut to_state) = if from.ordinal() < to.ordinal() {
                let f = from.lock_state();
                (f, to.lock_state())
            } else {
                let t = to.lock_state();
                (from.lock_state(), t)
            };

            let old = match from_state.take_block(block_id) {
                Ok(old) => old,
                Err(e) => {
                    to_state.release(reservation)?;
                    return Err(e);
                }
            };
            let new = BlockMeta::new(block_id, old.block_size(), to);
            if let Err(e) = to_state.insert_reserved_block(new.clone(), reservation) {
                from_state.insert_block(old)?;
                return Err(e);
            }
            self.blocks.insert(block_id, Arc::clone(to));
            new
        };

        debug!(
            "Moved block {} from {} to {}",
            block_id,
            from.location(),
            to.location()
        );
        Ok(moved)
    }

    /// Remove a committed block, returning its size to its dir
    pub fn remove_block_meta(&self, block_id: BlockId) -> Result<BlockMeta> {
        loop {
            let dir = self
                .block_dir(block_id)
                .ok_or(Error::BlockNotFound { block_id })?;

            let mut state = dir.lock_state();
            match state.take_block(block_id) {
                Ok(meta) => {
                    self.blocks.remove(&block_id);
                    return Ok(meta);
                }
                Err(Error::BlockNotFound { .. }) => {
                    drop(state);
                    match self.block_dir(block_id) {
                        None => return Err(Error::BlockNotFound { block_id }),
                        Some(current) if Arc::ptr_eq(&current, &dir) => {
                            return Err(Error::invariant(format!(
                                "block {block_id} is indexed in {} but missing there",
                                dir.location()
                            )));
                        }
                        // Moved meanwhile, follow it
                        Some(_) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Temporary blocks of one session across all dirs
    #[must_use]
    pub fn session_temp_blocks(&self, session_id: SessionId) -> Vec<TempBlockMeta> {
        self.dirs()
            .flat_map(|dir| dir.session_temp_blocks(session_id))
            .collect()
    }

    /// Drop every temporary block of a session, returning what was removed
    pub fn cleanup_session_temp_blocks(&self, session_id: SessionId) -> Result<Vec<TempBlockMeta>> {
        let mut removed = Vec::new();
        for dir in self.dirs() {
            let mut state = dir.lock_state();
            let metas = state.take_session_temps(session_id)?;
            for meta in &metas {
                self.temp_blocks.remove(&meta.block_id());
            }
            drop(state);
            removed.extend(metas);
        }
        Ok(removed)
    }

    /// Ids of all committed blocks, sorted
    #[must_use]
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<_> = self.blocks.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Check dir accounting and that the indexes agree with the dirs
    ///
    /// Only meaningful while no other operation is running.
    pub fn verify(&self) -> Result<()> {
        let mut committed = 0;
        let mut temp = 0;
        for dir in self.dirs() {
            dir.verify()?;
            committed += dir.block_count();
            temp += dir.temp_block_ids().len();
        }

        if committed != self.blocks.len() || temp != self.temp_blocks.len() {
            return Err(Error::invariant(format!(
                "index holds {} committed and {} temp blocks, dirs hold {} and {}",
                self.blocks.len(),
                self.temp_blocks.len(),
                committed,
                temp
            )));
        }

        let indexed: Vec<_> = self
            .blocks
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value()), false))
            .chain(
                self.temp_blocks
                    .iter()
                    .map(|e| (*e.key(), Arc::clone(e.value()), true)),
            )
            .collect();
        for (block_id, dir, temp) in indexed {
            let state = dir.lock_state();
            let present = if temp {
                state.has_temp_block(block_id)
            } else {
                state.has_block(block_id)
            };
            if !present {
                return Err(Error::invariant(format!(
                    "block {} is indexed in {} but missing there",
                    block_id,
                    dir.location()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::two_tier_config;
    use tempfile::tempdir;

    fn create_temp(manager: &BlockMetadataManager, dir: &Arc<StorageDir>, id: u64, bytes: u64) {
        let meta = TempBlockMeta::new(SessionId::new(1), BlockId::new(id), bytes, dir);
        manager.add_temp_block_meta(dir, meta).unwrap();
    }

    #[test]
    fn test_open_and_lookup() {
        let root = tempdir().unwrap();
        let manager = BlockMetadataManager::open(&two_tier_config(root.path(), 1000, 5000)).unwrap();

        assert_eq!(manager.tiers().len(), 2);
        assert_eq!(manager.tier("SSD").unwrap().level(), 1);
        assert!(matches!(manager.tier("HDD"), Err(Error::TierNotFound(_))));
        assert!(manager.dir("MEM", 0).is_ok());
        assert!(matches!(manager.dir("MEM", 1), Err(Error::DirNotFound { .. })));
        assert_eq!(manager.next_tier(0).unwrap().alias(), "SSD");
        assert!(manager.next_tier(1).is_none());
        assert!(manager.check_location(&BlockStoreLocation::dir("SSD", 3)).is_err());
    }

    #[test]
    fn test_commit_and_remove() {
        let root = tempdir().unwrap();
        let manager = BlockMetadataManager::open(&two_tier_config(root.path(), 1000, 5000)).unwrap();
        let mem = manager.dir("MEM", 0).unwrap();

        create_temp(&manager, &mem, 1, 400);
        assert!(manager.has_temp_block_meta(BlockId::new(1)));
        assert!(!manager.has_block_meta(BlockId::new(1)));

        let meta = manager.commit_temp_block_meta(BlockId::new(1), 300).unwrap();
        assert_eq!(meta.location(), &BlockStoreLocation::dir("MEM", 0));
        assert_eq!(mem.available_bytes(), 700);
        assert!(manager.has_block_meta(BlockId::new(1)));
        assert!(!manager.has_temp_block_meta(BlockId::new(1)));
        manager.verify().unwrap();

        manager.remove_block_meta(BlockId::new(1)).unwrap();
        assert_eq!(mem.available_bytes(), 1000);
        assert!(matches!(
            manager.block_location(BlockId::new(1)),
            Err(Error::BlockNotFound { .. })
        ));
        assert!(matches!(
            manager.remove_block_meta(BlockId::new(1)),
            Err(Error::BlockNotFound { .. })
        ));
        manager.verify().unwrap();
    }

    #[test]
    fn test_commit_never_exposes_id_to_other_dirs() {
        const IDS: u64 = 2000;
        let root = tempdir().unwrap();
        let manager = BlockMetadataManager::open(&two_tier_config(root.path(), 1_000_000, 1_000_000)).unwrap();
        let mem = manager.dir("MEM", 0).unwrap();
        let ssd = manager.dir("SSD", 0).unwrap();
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for id in 0..IDS {
                    let meta = TempBlockMeta::new(SessionId::new(1), BlockId::new(id), 10, &mem);
                    if manager.add_temp_block_meta(&mem, meta).is_ok() {
                        manager.commit_temp_block_meta(BlockId::new(id), 10).unwrap();
                    }
                }
                done.store(true, std::sync::atomic::Ordering::SeqCst);
            });
            s.spawn(|| {
                let mut id = 0;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    let meta = TempBlockMeta::new(SessionId::new(2), BlockId::new(id), 10, &ssd);
                    let _ = manager.add_temp_block_meta(&ssd, meta);
                    id = (id + 1) % IDS;
                }
            });
        });

        for id in 0..IDS {
            let block_id = BlockId::new(id);
            assert!(
                !(manager.has_block_meta(block_id) && manager.has_temp_block_meta(block_id)),
                "block {id} is committed and temporary at once"
            );
        }
        manager.verify().unwrap();
    }

    #[test]
    fn test_duplicate_ids_rejected_across_dirs() {
        let root = tempdir().unwrap();
        let manager = BlockMetadataManager::open(&two_tier_config(root.path(), 1000, 5000)).unwrap();
        let mem = manager.dir("MEM", 0).unwrap();
        let ssd = manager.dir("SSD", 0).unwrap();

        create_temp(&manager, &mem, 7, 100);
        let dup = TempBlockMeta::new(SessionId::new(2), BlockId::new(7), 100, &ssd);
        assert!(matches!(
            manager.add_temp_block_meta(&ssd, dup),
            Err(Error::BlockAlreadyExists { .. })
        ));
        assert_eq!(ssd.available_bytes(), 5000);

        manager.commit_temp_block_meta(BlockId::new(7), 100).unwrap();
        let dup = TempBlockMeta::new(SessionId::new(2), BlockId::new(7), 100, &ssd);
        assert!(manager.add_temp_block_meta(&ssd, dup).is_err());
    }

    #[test]
    fn test_move_block_meta() {
        let root = tempdir().unwrap();
        let manager = BlockMetadataManager::open(&two_tier_config(root.path(), 1000, 5000)).unwrap();
        let mem = manager.dir("MEM", 0).unwrap();
        let ssd = manager.dir("SSD", 0).unwrap();

        create_temp(&manager, &mem, 1, 600);
        manager.commit_temp_block_meta(BlockId::new(1), 600).unwrap();

        let reservation = ssd.reserve(600).unwrap();
        let moved = manager
            .move_block_meta(BlockId::new(1), &ssd, reservation)
            .unwrap();
        assert_eq!(moved.location(), &BlockStoreLocation::dir("SSD", 0));
        assert_eq!(mem.available_bytes(), 1000);
        assert_eq!(ssd.available_bytes(), 4400);
        assert_eq!(
            manager.block_meta(BlockId::new(1)).unwrap().location(),
            &BlockStoreLocation::dir("SSD", 0)
        );
        manager.verify().unwrap();

        // Moving into its own dir gives the reservation back
        let reservation = ssd.reserve(600).unwrap();
        assert!(manager.move_block_meta(BlockId::new(1), &ssd, reservation).is_err());
        assert_eq!(ssd.available_bytes(), 4400);
    }

    #[test]
    fn test_abort_and_session_cleanup() {
        let root = tempdir().unwrap();
        let manager = BlockMetadataManager::open(&two_tier_config(root.path(), 1000, 5000)).unwrap();
        let mem = manager.dir("MEM", 0).unwrap();
        let ssd = manager.dir("SSD", 0).unwrap();

        create_temp(&manager, &mem, 1, 100);
        create_temp(&manager, &ssd, 2, 200);
        manager
            .add_temp_block_meta(&ssd, TempBlockMeta::new(SessionId::new(9), BlockId::new(3), 50, &ssd))
            .unwrap();

        manager.abort_temp_block_meta(BlockId::new(1)).unwrap();
        assert_eq!(mem.available_bytes(), 1000);

        assert_eq!(manager.session_temp_blocks(SessionId::new(1)).len(), 1);
        let removed = manager.cleanup_session_temp_blocks(SessionId::new(1)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(ssd.available_bytes(), 4950);
        assert!(manager.has_temp_block_meta(BlockId::new(3)));
        manager.verify().unwrap();
    }

    #[test]
    fn test_open_drops_duplicate_files() {
        let root = tempdir().unwrap();
        let config = two_tier_config(root.path(), 1000, 5000);
        for tier in &config.tiers {
            std::fs::create_dir_all(&tier.dirs[0].path).unwrap();
            std::fs::write(tier.dirs[0].path.join("42"), vec![1u8; 10]).unwrap();
        }

        let manager = BlockMetadataManager::open(&config).unwrap();
        assert_eq!(manager.block_count(), 1);
        assert_eq!(
            manager.block_meta(BlockId::new(42)).unwrap().location(),
            &BlockStoreLocation::dir("MEM", 0)
        );
        assert!(!config.tiers[1].dirs[0].path.join("42").exists());
        manager.verify().unwrap();
    }
}
