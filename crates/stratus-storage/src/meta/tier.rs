//! Storage tier: an ordered group of dirs sharing an alias

use crate::meta::StorageDir;
use std::sync::Arc;
use stratus_common::{Error, Result, TierConfig};

/// One tier of the store, e.g. MEM, SSD or HDD
///
/// Level 0 is the fastest tier. The set of dirs is fixed once opened.
#[derive(Debug)]
pub struct StorageTier {
    alias: String,
    level: usize,
    dirs: Vec<Arc<StorageDir>>,
    reserved_bytes: u64,
}

impl StorageTier {
    /// Open every dir of the tier
    pub fn open(config: &TierConfig, level: usize) -> Result<Self> {
        let dirs = config
            .dirs
            .iter()
            .enumerate()
            .map(|(index, dir)| StorageDir::open(&config.alias, level, index, dir).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            alias: config.alias.clone(),
            level,
            dirs,
            reserved_bytes: config.reserved_bytes,
        })
    }

    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    #[must_use]
    pub const fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub fn dirs(&self) -> &[Arc<StorageDir>] {
        &self.dirs
    }

    pub fn dir(&self, dir_index: usize) -> Result<&Arc<StorageDir>> {
        self.dirs.get(dir_index).ok_or_else(|| Error::DirNotFound {
            tier_alias: self.alias.clone(),
            dir_index,
        })
    }

    /// Bytes the space reserver keeps free in this tier
    #[must_use]
    pub const fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.dirs.iter().map(|d| d.capacity_bytes()).sum()
    }

    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.dirs.iter().map(|d| d.available_bytes()).sum()
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.capacity_bytes() - self.available_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::DirConfig;
    use tempfile::tempdir;

    #[test]
    fn test_open_tier() {
        let root = tempdir().unwrap();
        let config = TierConfig {
            alias: "SSD".into(),
            dirs: vec![
                DirConfig {
                    path: root.path().join("ssd0"),
                    capacity_bytes: 1000,
                },
                DirConfig {
                    path: root.path().join("ssd1"),
                    capacity_bytes: 3000,
                },
            ],
            reserved_bytes: 0,
        };

        let tier = StorageTier::open(&config, 1).unwrap();
        assert_eq!(tier.alias(), "SSD");
        assert_eq!(tier.level(), 1);
        assert_eq!(tier.dirs().len(), 2);
        assert_eq!(tier.capacity_bytes(), 4000);
        assert_eq!(tier.used_bytes(), 0);
        assert_eq!(tier.dir(1).unwrap().capacity_bytes(), 3000);
        assert_eq!(tier.dir(1).unwrap().ordinal(), (1, 1));
        assert!(matches!(tier.dir(2), Err(Error::DirNotFound { dir_index: 2, .. })));
    }
}
