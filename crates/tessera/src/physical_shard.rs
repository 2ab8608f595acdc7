//! Physical-shard bookkeeping.
//!
//! Storage engines that encode location metadata group contiguous ranges
//! into physical shards keyed by the head of the owning data-move id. The
//! collection only mirrors the shard map; a periodic monitor drops physical
//! shards that no longer own any range.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::tracker::TeamRef;
use crate::{KeyRange, Uid};

/// Head of a move id, used as the physical shard key.
pub fn physical_shard_id(move_id: Uid) -> u64 {
    move_id.as_u64_pair().0
}

#[derive(Clone, Debug, Default)]
struct PhysicalShard {
    ranges: Vec<KeyRange>,
    teams: Vec<TeamRef>,
}

#[derive(Default)]
pub struct PhysicalShardCollection {
    shards: Mutex<BTreeMap<u64, PhysicalShard>>,
}

impl PhysicalShardCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `range` under physical shard `id`, detaching it from any
    /// shard that held it before.
    pub fn assign_range(&self, id: u64, range: &KeyRange, teams: Vec<TeamRef>) {
        let mut shards = self.shards.lock().unwrap();
        for shard in shards.values_mut() {
            shard.ranges.retain(|r| r != range);
        }
        let shard = shards.entry(id).or_default();
        shard.ranges.push(range.clone());
        shard.teams = teams;
    }

    pub fn shard_count(&self) -> usize {
        self.shards.lock().unwrap().len()
    }

    pub fn range_count(&self, id: u64) -> usize {
        self.shards
            .lock()
            .unwrap()
            .get(&id)
            .map(|s| s.ranges.len())
            .unwrap_or(0)
    }

    /// Drop physical shards that own no range; returns how many went away.
    pub fn cleanup_empty(&self) -> usize {
        let mut shards = self.shards.lock().unwrap();
        let before = shards.len();
        shards.retain(|_, shard| !shard.ranges.is_empty());
        before - shards.len()
    }

    pub fn log_collection(&self) {
        let shards = self.shards.lock().unwrap();
        let total_ranges: usize = shards.values().map(|s| s.ranges.len()).sum();
        debug!(
            physical_shards = shards.len(),
            ranges = total_ranges,
            "physical shard collection status"
        );
    }

    /// Periodic cleanup and status logging.
    pub async fn monitor(self: Arc<Self>, delay: Duration) {
        loop {
            let removed = self.cleanup_empty();
            if removed > 0 {
                info!(removed, "cleaned up empty physical shards");
            }
            self.log_collection();
            tokio::time::sleep(delay).await;
        }
    }
}
