//! Shard tracking: per-range metrics, split/merge planning, and the
//! shard-to-team registry consulted on team failures.
//!
//! The tracker owns the in-memory picture of the shard map. Sustained size
//! or write-bandwidth pressure splits a shard; adjacent cold shards merge.
//! Both paths emit relocations; the queue decides placement and persists the
//! resulting moves.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::knobs::{Knobs, PRIORITY_MERGE_SHARD, PRIORITY_SPLIT_SHARD, PRIORITY_TEAM_UNHEALTHY};
use crate::{KeyRange, Uid};

/// Consecutive over-threshold observations required before a split.
const SPLIT_SUSTAINED_INTERVALS: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocateReason {
    SizeSplit,
    WriteSplit,
    Merge,
    Rebalance,
    TeamUnhealthy,
    RecoverMove,
    Other,
}

/// One relocation request flowing from the tracker (or bootstrap resume)
/// into the relocation queue.
#[derive(Clone, Debug)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub priority: i32,
    pub reason: RelocateReason,
    /// Present when resuming or cancelling a persisted data move.
    pub data_move_id: Option<Uid>,
    pub cancelled: bool,
}

impl RelocateShard {
    pub fn new(keys: KeyRange, priority: i32, reason: RelocateReason) -> Self {
        Self {
            keys,
            priority,
            reason,
            data_move_id: None,
            cancelled: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct TrackedShard {
    end: Vec<u8>,
    bytes: u64,
    write_bytes_per_sec: u64,
    sustained_split_pressure: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardMetrics {
    pub keys: KeyRange,
    pub shard_bytes: u64,
    pub write_bytes_per_sec: u64,
}

pub struct ShardTracker {
    shards: BTreeMap<Vec<u8>, TrackedShard>,
    output: mpsc::UnboundedSender<RelocateShard>,
    knobs: Knobs,
}

impl ShardTracker {
    pub fn new(knobs: Knobs, output: mpsc::UnboundedSender<RelocateShard>) -> Self {
        let mut shards = BTreeMap::new();
        shards.insert(
            Vec::new(),
            TrackedShard {
                end: crate::keys::USER_KEYSPACE_END.to_vec(),
                ..Default::default()
            },
        );
        Self {
            shards,
            output,
            knobs,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_ranges(&self) -> Vec<KeyRange> {
        self.shards
            .iter()
            .map(|(begin, shard)| KeyRange::new(begin.clone(), shard.end.clone()))
            .collect()
    }

    /// Introduce a boundary at `key`, splitting the covering shard. Metrics
    /// stay on the left half until the next observation.
    fn carve(&mut self, key: &[u8]) {
        if key.is_empty() || key >= crate::keys::USER_KEYSPACE_END {
            return;
        }
        let Some((begin, shard)) = self
            .shards
            .range::<[u8], _>((
                std::ops::Bound::Unbounded,
                std::ops::Bound::Included(key),
            ))
            .next_back()
            .map(|(b, s)| (b.clone(), s.clone()))
        else {
            return;
        };
        if begin.as_slice() == key || shard.end.as_slice() <= key {
            return;
        }
        let right = TrackedShard {
            end: shard.end.clone(),
            ..Default::default()
        };
        self.shards.get_mut(&begin).expect("carved shard").end = key.to_vec();
        self.shards.insert(key.to_vec(), right);
    }

    /// Register a shard boundary pair, used when loading the initial shard
    /// map at bootstrap.
    pub fn track_shard(&mut self, range: &KeyRange) {
        self.carve(&range.begin);
        self.carve(&range.end);
    }

    /// Feed one metrics observation for the shard containing `range.begin`
    /// and run split/merge planning for it.
    pub fn update_shard_metrics(
        &mut self,
        range: &KeyRange,
        bytes: u64,
        write_bytes_per_sec: u64,
    ) {
        let Some(begin) = self
            .shards
            .range::<[u8], _>((
                std::ops::Bound::Unbounded,
                std::ops::Bound::Included(range.begin.as_slice()),
            ))
            .next_back()
            .map(|(b, _)| b.clone())
        else {
            return;
        };
        {
            let shard = self.shards.get_mut(&begin).expect("tracked shard");
            shard.bytes = bytes;
            shard.write_bytes_per_sec = write_bytes_per_sec;
        }
        self.maybe_split(&begin);
        self.maybe_merge(&begin);
    }

    fn maybe_split(&mut self, begin: &[u8]) {
        let knobs = self.knobs.clone();
        let (end, bytes, write_bps, sustained) = {
            let shard = self.shards.get_mut(begin).expect("tracked shard");
            let over = shard.bytes > knobs.shard_split_bytes
                || shard.write_bytes_per_sec > knobs.shard_split_write_bandwidth;
            if over {
                shard.sustained_split_pressure = shard.sustained_split_pressure.saturating_add(1);
            } else {
                shard.sustained_split_pressure = 0;
            }
            (
                shard.end.clone(),
                shard.bytes,
                shard.write_bytes_per_sec,
                shard.sustained_split_pressure,
            )
        };
        if sustained < SPLIT_SUSTAINED_INTERVALS {
            return;
        }
        let Some(split_key) = midpoint_key(begin, &end) else {
            return;
        };
        let reason = if write_bps > knobs.shard_split_write_bandwidth {
            RelocateReason::WriteSplit
        } else {
            RelocateReason::SizeSplit
        };
        info!(
            range = ?KeyRange::new(begin.to_vec(), end.clone()),
            bytes,
            write_bps,
            ?reason,
            "splitting shard"
        );
        self.carve(&split_key);
        // Halve the recorded load so neither side immediately re-triggers.
        if let Some(left) = self.shards.get_mut(begin) {
            left.bytes = bytes / 2;
            left.write_bytes_per_sec = write_bps / 2;
            left.sustained_split_pressure = 0;
        }
        if let Some(right) = self.shards.get_mut(&split_key) {
            right.bytes = bytes / 2;
            right.write_bytes_per_sec = write_bps / 2;
        }
        let _ = self.output.send(RelocateShard::new(
            KeyRange::new(split_key, end),
            PRIORITY_SPLIT_SHARD,
            reason,
        ));
    }

    fn maybe_merge(&mut self, begin: &[u8]) {
        let Some(shard) = self.shards.get(begin).cloned() else {
            return;
        };
        let Some((right_begin, right)) = self
            .shards
            .range::<[u8], _>((
                std::ops::Bound::Excluded(begin),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(b, s)| (b.clone(), s.clone()))
        else {
            return;
        };
        if right_begin != shard.end {
            return;
        }
        if shard.bytes + right.bytes >= self.knobs.shard_merge_bytes {
            return;
        }
        debug!(
            left = ?KeyRange::new(begin.to_vec(), shard.end.clone()),
            right = ?KeyRange::new(right_begin.clone(), right.end.clone()),
            "merging adjacent cold shards"
        );
        self.shards.remove(&right_begin);
        let merged = self.shards.get_mut(begin).expect("merged shard");
        merged.end = right.end.clone();
        merged.bytes = shard.bytes + right.bytes;
        merged.sustained_split_pressure = 0;
        let _ = self.output.send(RelocateShard::new(
            KeyRange::new(begin.to_vec(), right.end),
            PRIORITY_MERGE_SHARD,
            RelocateReason::Merge,
        ));
    }

    /// Relocate every range owned by a failed team.
    pub fn relocate_for_team_failure(&self, ranges: Vec<KeyRange>) {
        for keys in ranges {
            let _ = self.output.send(RelocateShard::new(
                keys,
                PRIORITY_TEAM_UNHEALTHY,
                RelocateReason::TeamUnhealthy,
            ));
        }
    }

    /// Per-shard metrics for `range`, capped at `limit` shards.
    pub fn get_metrics(&self, range: &KeyRange, limit: usize) -> Vec<ShardMetrics> {
        let mut out = Vec::new();
        for (begin, shard) in &self.shards {
            let keys = KeyRange::new(begin.clone(), shard.end.clone());
            if !keys.overlaps(range) {
                continue;
            }
            out.push(ShardMetrics {
                keys,
                shard_bytes: shard.bytes,
                write_bytes_per_sec: shard.write_bytes_per_sec,
            });
            if out.len() >= limit {
                break;
            }
        }
        out
    }

    pub fn median_shard_size(&self, range: &KeyRange) -> i64 {
        let mut sizes: Vec<u64> = self
            .get_metrics(range, usize::MAX)
            .into_iter()
            .map(|m| m.shard_bytes)
            .collect();
        if sizes.is_empty() {
            return 0;
        }
        let mid = sizes.len() / 2;
        sizes.select_nth_unstable(mid);
        sizes[mid] as i64
    }
}

/// A key strictly inside `(begin, end)`, if one exists.
fn midpoint_key(begin: &[u8], end: &[u8]) -> Option<Vec<u8>> {
    let mut candidate = begin.to_vec();
    candidate.push(0x80);
    if candidate.as_slice() < end {
        return Some(candidate);
    }
    let mut next = begin.to_vec();
    next.push(0x00);
    if next.as_slice() < end {
        return Some(next);
    }
    None
}

/// Which teams own which ranges; consulted when a team loses a server so
/// every affected range can be relocated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TeamRef {
    pub servers: Vec<Uid>,
    pub primary: bool,
}

#[derive(Clone, Debug, Default)]
struct RegisteredShard {
    end: Vec<u8>,
    teams: Vec<TeamRef>,
}

pub struct ShardRegistry {
    ranges: BTreeMap<Vec<u8>, RegisteredShard>,
}

impl Default for ShardRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardRegistry {
    pub fn new() -> Self {
        let mut ranges = BTreeMap::new();
        ranges.insert(
            Vec::new(),
            RegisteredShard {
                end: crate::keys::USER_KEYSPACE_END.to_vec(),
                teams: Vec::new(),
            },
        );
        Self { ranges }
    }

    fn carve(&mut self, key: &[u8]) {
        if key.is_empty() || key >= crate::keys::USER_KEYSPACE_END {
            return;
        }
        let Some((begin, shard)) = self
            .ranges
            .range::<[u8], _>((
                std::ops::Bound::Unbounded,
                std::ops::Bound::Included(key),
            ))
            .next_back()
            .map(|(b, s)| (b.clone(), s.clone()))
        else {
            return;
        };
        if begin.as_slice() == key || shard.end.as_slice() <= key {
            return;
        }
        self.ranges.get_mut(&begin).expect("carved range").end = key.to_vec();
        self.ranges.insert(
            key.to_vec(),
            RegisteredShard {
                end: shard.end,
                teams: shard.teams,
            },
        );
    }

    pub fn define_shard(&mut self, range: &KeyRange) {
        self.carve(&range.begin);
        self.carve(&range.end);
    }

    /// Record `teams` as the owners of `range`.
    pub fn move_shard(&mut self, range: &KeyRange, teams: Vec<TeamRef>) {
        self.define_shard(range);
        let covered: Vec<Vec<u8>> = self
            .ranges
            .range::<[u8], _>((
                std::ops::Bound::Included(range.begin.as_slice()),
                std::ops::Bound::Excluded(range.end.as_slice()),
            ))
            .map(|(b, _)| b.clone())
            .collect();
        for begin in covered {
            self.ranges.get_mut(&begin).expect("moved range").teams = teams.clone();
        }
    }

    pub fn teams_for(&self, key: &[u8]) -> Vec<TeamRef> {
        self.ranges
            .range::<[u8], _>((
                std::ops::Bound::Unbounded,
                std::ops::Bound::Included(key),
            ))
            .next_back()
            .map(|(_, s)| s.teams.clone())
            .unwrap_or_default()
    }

    /// Every range with `server` on one of its teams.
    pub fn ranges_for_server(&self, server: Uid) -> Vec<KeyRange> {
        self.ranges
            .iter()
            .filter(|(_, shard)| {
                shard
                    .teams
                    .iter()
                    .any(|team| team.servers.contains(&server))
            })
            .map(|(begin, shard)| KeyRange::new(begin.clone(), shard.end.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Ranges must tile the keyspace exactly.
    pub fn check(&self) {
        let mut expected: Vec<u8> = Vec::new();
        for (begin, shard) in &self.ranges {
            assert_eq!(begin, &expected, "registry ranges must be contiguous");
            assert!(shard.end > *begin, "registry range must be non-empty");
            expected = shard.end.clone();
        }
        assert_eq!(expected, crate::keys::USER_KEYSPACE_END.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with_rx() -> (ShardTracker, mpsc::UnboundedReceiver<RelocateShard>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut knobs = Knobs::default();
        knobs.shard_split_bytes = 1000;
        knobs.shard_merge_bytes = 100;
        knobs.shard_split_write_bandwidth = u64::MAX;
        (ShardTracker::new(knobs, tx), rx)
    }

    #[test]
    fn sustained_pressure_splits_a_shard() {
        let (mut tracker, mut rx) = tracker_with_rx();
        let all = KeyRange::all();
        for _ in 0..SPLIT_SUSTAINED_INTERVALS {
            tracker.update_shard_metrics(&all, 5000, 0);
        }
        let rs = rx.try_recv().expect("split relocation");
        assert_eq!(rs.priority, PRIORITY_SPLIT_SHARD);
        assert_eq!(rs.reason, RelocateReason::SizeSplit);
        assert_eq!(tracker.shard_count(), 2);

        // One observation under threshold resets the streak.
        let (mut tracker, mut rx) = tracker_with_rx();
        tracker.update_shard_metrics(&all, 5000, 0);
        tracker.update_shard_metrics(&all, 10, 0);
        tracker.update_shard_metrics(&all, 5000, 0);
        tracker.update_shard_metrics(&all, 5000, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cold_adjacent_shards_merge() {
        let (mut tracker, mut rx) = tracker_with_rx();
        tracker.track_shard(&KeyRange::new(b"".to_vec(), b"m".to_vec()));
        assert_eq!(tracker.shard_count(), 2);

        tracker.update_shard_metrics(&KeyRange::new(b"".to_vec(), b"m".to_vec()), 10, 0);
        let rs = rx.try_recv().expect("merge relocation");
        assert_eq!(rs.priority, PRIORITY_MERGE_SHARD);
        assert_eq!(rs.reason, RelocateReason::Merge);
        assert_eq!(tracker.shard_count(), 1);
    }

    #[test]
    fn median_shard_size_picks_the_middle() {
        let (mut tracker, _rx) = tracker_with_rx();
        tracker.track_shard(&KeyRange::new(b"".to_vec(), b"b".to_vec()));
        tracker.track_shard(&KeyRange::new(b"b".to_vec(), b"c".to_vec()));
        tracker.update_shard_metrics(&KeyRange::new(b"".to_vec(), b"b".to_vec()), 10, 0);
        tracker.update_shard_metrics(&KeyRange::new(b"b".to_vec(), b"c".to_vec()), 200, 0);
        tracker.update_shard_metrics(
            &KeyRange::new(b"c".to_vec(), crate::keys::USER_KEYSPACE_END.to_vec()),
            30,
            0,
        );
        assert_eq!(tracker.median_shard_size(&KeyRange::all()), 30);
    }

    #[test]
    fn registry_tracks_server_ownership_across_moves() {
        let mut registry = ShardRegistry::new();
        let a = Uid::from_u128(1);
        let b = Uid::from_u128(2);

        let left = KeyRange::new(b"".to_vec(), b"m".to_vec());
        let right = KeyRange::new(b"m".to_vec(), crate::keys::USER_KEYSPACE_END.to_vec());
        registry.move_shard(
            &left,
            vec![TeamRef {
                servers: vec![a],
                primary: true,
            }],
        );
        registry.move_shard(
            &right,
            vec![TeamRef {
                servers: vec![b],
                primary: true,
            }],
        );
        registry.check();

        assert_eq!(registry.ranges_for_server(a), vec![left.clone()]);
        assert_eq!(registry.ranges_for_server(b), vec![right.clone()]);

        // Moving the left range to b leaves a with nothing.
        registry.move_shard(
            &left,
            vec![TeamRef {
                servers: vec![b],
                primary: true,
            }],
        );
        assert!(registry.ranges_for_server(a).is_empty());
        assert_eq!(registry.ranges_for_server(b).len(), 2);
        registry.check();
    }
}
