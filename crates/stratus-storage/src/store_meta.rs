//! Capacity report of a block store
//!
//! Built in one pass over the tiers, taking one dir mutex at a time and no
//! block locks. The numbers of different dirs may come from slightly
//! different instants; each dir is consistent on its own.

use crate::manager::BlockMetadataManager;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use stratus_common::{BlockId, WorkerInfoField};

/// Usage of one dir
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DirUsage {
    pub dir_index: usize,
    pub path: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub block_count: usize,
}

/// Usage of one tier and its dirs
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub alias: String,
    pub level: usize,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub dirs: Vec<DirUsage>,
}

/// Capacity, usage and optionally block ids of a store
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockStoreMeta {
    tiers: Vec<TierUsage>,
    block_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_list: Option<BTreeMap<String, Vec<BlockId>>>,
}

impl BlockStoreMeta {
    /// Usage report without block ids
    #[must_use]
    pub fn new(metadata: &BlockMetadataManager) -> Self {
        Self::build(metadata, false)
    }

    /// Usage report with the committed block ids of every tier
    #[must_use]
    pub fn new_full(metadata: &BlockMetadataManager) -> Self {
        Self::build(metadata, true)
    }

    fn build(metadata: &BlockMetadataManager, with_blocks: bool) -> Self {
        let mut block_list = with_blocks.then(BTreeMap::new);
        let mut block_count = 0;

        let tiers = metadata
            .tiers()
            .iter()
            .map(|tier| {
                let dirs: Vec<_> = tier
                    .dirs()
                    .iter()
                    .map(|dir| {
                        let snapshot = dir.snapshot();
                        block_count += snapshot.blocks.len();
                        if let Some(list) = block_list.as_mut() {
                            list.entry(tier.alias().to_string())
                                .or_insert_with(Vec::new)
                                .extend(snapshot.blocks.iter().map(|(id, _)| *id));
                        }
                        DirUsage {
                            dir_index: dir.dir_index(),
                            path: dir.path().display().to_string(),
                            capacity_bytes: snapshot.capacity_bytes,
                            used_bytes: snapshot.capacity_bytes - snapshot.available_bytes,
                            block_count: snapshot.blocks.len(),
                        }
                    })
                    .collect();
                TierUsage {
                    alias: tier.alias().to_string(),
                    level: tier.level(),
                    capacity_bytes: dirs.iter().map(|d| d.capacity_bytes).sum(),
                    used_bytes: dirs.iter().map(|d| d.used_bytes).sum(),
                    dirs,
                }
            })
            .collect();

        if let Some(list) = block_list.as_mut() {
            for ids in list.values_mut() {
                ids.sort_unstable();
            }
        }

        Self {
            tiers,
            block_count,
            block_list,
        }
    }

    #[must_use]
    pub fn tiers(&self) -> &[TierUsage] {
        &self.tiers
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.tiers.iter().map(|t| t.capacity_bytes).sum()
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.tiers.iter().map(|t| t.used_bytes).sum()
    }

    #[must_use]
    pub fn capacity_bytes_on_tiers(&self) -> HashMap<String, u64> {
        self.tiers
            .iter()
            .map(|t| (t.alias.clone(), t.capacity_bytes))
            .collect()
    }

    #[must_use]
    pub fn used_bytes_on_tiers(&self) -> HashMap<String, u64> {
        self.tiers
            .iter()
            .map(|t| (t.alias.clone(), t.used_bytes))
            .collect()
    }

    /// Capacity keyed by (tier alias, dir path)
    #[must_use]
    pub fn capacity_bytes_on_dirs(&self) -> HashMap<(String, String), u64> {
        self.per_dir(|d| d.capacity_bytes)
    }

    /// Used bytes keyed by (tier alias, dir path)
    #[must_use]
    pub fn used_bytes_on_dirs(&self) -> HashMap<(String, String), u64> {
        self.per_dir(|d| d.used_bytes)
    }

    fn per_dir(&self, value: impl Fn(&DirUsage) -> u64) -> HashMap<(String, String), u64> {
        self.tiers
            .iter()
            .flat_map(|t| {
                t.dirs
                    .iter()
                    .map(|d| ((t.alias.clone(), d.path.clone()), value(d)))
            })
            .collect()
    }

    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.block_count
    }

    /// Committed block ids per tier alias, if this is a full report
    #[must_use]
    pub fn block_list(&self) -> Option<&BTreeMap<String, Vec<BlockId>>> {
        self.block_list.as_ref()
    }

    /// JSON object with the requested fields this report can answer
    ///
    /// Worker identity fields (address, id, state, timestamps) belong to the
    /// reporting layer and are skipped here.
    #[must_use]
    pub fn select(&self, fields: &BTreeSet<WorkerInfoField>) -> Map<String, Value> {
        let mut out = Map::new();
        for field in fields {
            let value = match field {
                WorkerInfoField::CapacityBytes => json!(self.capacity_bytes()),
                WorkerInfoField::UsedBytes => json!(self.used_bytes()),
                WorkerInfoField::CapacityBytesOnTiers => json!(self.ordered_tiers(|t| t.capacity_bytes)),
                WorkerInfoField::UsedBytesOnTiers => json!(self.ordered_tiers(|t| t.used_bytes)),
                _ => continue,
            };
            out.insert(field.wire_name().to_string(), value);
        }
        out
    }

    fn ordered_tiers(&self, value: impl Fn(&TierUsage) -> u64) -> BTreeMap<String, u64> {
        self.tiers.iter().map(|t| (t.alias.clone(), value(t))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::TempBlockMeta;
    use crate::test_utils::two_tier_config;
    use stratus_common::SessionId;
    use tempfile::{TempDir, tempdir};

    const TEST_SESSION: SessionId = SessionId::new(33);
    const TEST_BLOCK_SIZE: u64 = 200;
    const COMMITTED_BLOCKS: u64 = 10;

    /// MEM 5000 bytes, SSD 60000 bytes, ten 200-byte blocks committed in MEM
    fn setup() -> (TempDir, BlockMetadataManager) {
        let root = tempdir().unwrap();
        let manager = BlockMetadataManager::open(&two_tier_config(root.path(), 5000, 60000)).unwrap();
        let mem = manager.dir("MEM", 0).unwrap();
        for id in 0..COMMITTED_BLOCKS {
            let block = BlockId::new(id);
            manager
                .add_temp_block_meta(&mem, TempBlockMeta::new(TEST_SESSION, block, TEST_BLOCK_SIZE, &mem))
                .unwrap();
            manager.commit_temp_block_meta(block, TEST_BLOCK_SIZE).unwrap();
        }
        (root, manager)
    }

    #[test]
    fn test_capacity_and_usage() {
        let (_root, manager) = setup();
        let meta = BlockStoreMeta::new(&manager);

        assert_eq!(meta.capacity_bytes(), 65000);
        assert_eq!(meta.used_bytes(), 2000);
        assert_eq!(
            meta.capacity_bytes_on_tiers(),
            HashMap::from([("MEM".to_string(), 5000), ("SSD".to_string(), 60000)])
        );
        assert_eq!(
            meta.used_bytes_on_tiers(),
            HashMap::from([("MEM".to_string(), 2000), ("SSD".to_string(), 0)])
        );
        assert_eq!(meta.block_count(), 10);
        assert!(meta.block_list().is_none());
    }

    #[test]
    fn test_per_dir() {
        let (_root, manager) = setup();
        let meta = BlockStoreMeta::new(&manager);
        let capacity = meta.capacity_bytes_on_dirs();
        let used = meta.used_bytes_on_dirs();
        assert_eq!(capacity.len(), 2);
        assert_eq!(used.len(), 2);

        let mem_path = manager.dir("MEM", 0).unwrap().path().display().to_string();
        assert_eq!(capacity[&("MEM".to_string(), mem_path.clone())], 5000);
        assert_eq!(used[&("MEM".to_string(), mem_path)], 2000);
    }

    #[test]
    fn test_full_report_lists_blocks() {
        let (_root, manager) = setup();
        let meta = BlockStoreMeta::new_full(&manager);
        let list = meta.block_list().unwrap();
        assert_eq!(list["MEM"].len(), 10);
        assert_eq!(list["MEM"][0], BlockId::new(0));
        assert!(list["SSD"].is_empty());
    }

    #[test]
    fn test_select_fields() {
        let (_root, manager) = setup();
        let meta = BlockStoreMeta::new(&manager);
        let fields = BTreeSet::from([
            WorkerInfoField::UsedBytesOnTiers,
            WorkerInfoField::CapacityBytes,
            WorkerInfoField::Address,
        ]);

        let out = meta.select(&fields);
        assert_eq!(out.len(), 2);
        assert_eq!(out["CAPACITY_BYTES"], json!(65000));
        assert_eq!(out["USED_BYTES_ON_TIERS"], json!({"MEM": 2000, "SSD": 0}));
    }

    #[test]
    fn test_serialize() {
        let (_root, manager) = setup();
        let value = serde_json::to_value(BlockStoreMeta::new(&manager)).unwrap();
        assert_eq!(value["block_count"], json!(10));
        assert_eq!(value["tiers"][0]["alias"], json!("MEM"));
        assert!(value.get("block_list").is_none());
    }
}
