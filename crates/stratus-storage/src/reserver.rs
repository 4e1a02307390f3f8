//! Background space reserver
//!
//! Keeps `reserved_bytes` free in every tier that configures it, so writes
//! into upper tiers rarely have to wait for eviction. Each dir is asked to
//! keep its share of the tier reservation, proportional to its capacity.

use crate::store::TieredBlockStore;
use std::sync::Arc;
use stratus_common::SessionId;
use tracing::{debug, warn};

pub struct SpaceReserver {
    store: Arc<TieredBlockStore>,
}

impl SpaceReserver {
    #[must_use]
    pub fn new(store: Arc<TieredBlockStore>) -> Self {
        Self { store }
    }

    /// One pass over all tiers, returning how many blocks were evicted
    ///
    /// Failures are logged and the pass continues with the next dir.
    pub fn reserve_space(&self) -> usize {
        let mut evicted = 0;
        for tier in self.store.tiers() {
            let reserved = tier.reserved_bytes();
            if reserved == 0 || tier.available_bytes() >= reserved {
                continue;
            }
            let capacity = tier.capacity_bytes();

            for dir in tier.dirs() {
                let share = u64::try_from(
                    u128::from(reserved) * u128::from(dir.capacity_bytes()) / u128::from(capacity),
                )
                .unwrap_or(reserved);
                if dir.available_bytes() >= share {
                    continue;
                }
                match self
                    .store
                    .free_space(SessionId::SPACE_RESERVER, share, &dir.location())
                {
                    Ok(ids) => evicted += ids.len(),
                    Err(e) => warn!(
                        "Space reserver could not free {} bytes in {}: {}",
                        share,
                        dir.location(),
                        e
                    ),
                }
            }
        }
        if evicted > 0 {
            debug!("Space reserver evicted {} blocks", evicted);
        }
        evicted
    }
}
