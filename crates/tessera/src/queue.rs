//! Relocation queue and persisted data moves.
//!
//! Relocations are executed in priority order, at most one per overlapping
//! range, bounded by the move parallelism knob. Every move is persisted as
//! data-move metadata before any shard-map edit so a restarted distributor
//! can resume or cancel it; the shard map and the move row always agree on
//! the move id.

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::keys;
use crate::knobs::{Knobs, PRIORITY_RECOVER_MOVE};
use crate::lock::{check_move_keys_lock, MoveKeysLock};
use crate::snapshot::DdEnabledState;
use crate::store::{rangemap_get, rangemap_set, SystemStore, Transaction};
use crate::teams::TeamCollection;
use crate::tracker::{RelocateShard, ShardRegistry, TeamRef};
use crate::{KeyRange, Uid};

/// Value stored per range of the shard map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub src_primary: Vec<Uid>,
    pub src_remote: Vec<Uid>,
    /// Set while a data move targets this range; must match the move row.
    pub dest_id: Option<Uid>,
    pub dest_primary: Vec<Uid>,
    pub dest_remote: Vec<Uid>,
}

impl ShardAssignment {
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(bytes).unwrap_or_default()
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("shard assignment is serializable")
    }

    pub fn has_dest(&self) -> bool {
        !self.dest_primary.is_empty() || !self.dest_remote.is_empty()
    }
}

/// Durable record of an intended or in-flight range move.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMoveMetadata {
    pub id: Uid,
    pub ranges: Vec<KeyRange>,
    pub primary_dest: Vec<Uid>,
    pub remote_dest: Vec<Uid>,
    pub cancelled: bool,
}

pub fn read_data_moves(tr: &mut Transaction<'_>) -> Result<Vec<DataMoveMetadata>> {
    let prefix = keys::data_move_prefix();
    let end = keys::prefix_end(&prefix);
    let mut moves = Vec::new();
    for (_, value) in tr.get_range(&prefix, &end) {
        moves.push(serde_json::from_slice(&value)?);
    }
    Ok(moves)
}

/// In-memory view of a persisted move while it is being resumed.
#[derive(Clone, Debug)]
pub struct DataMove {
    pub meta: DataMoveMetadata,
    pub valid: bool,
    pub cancelled: bool,
}

impl DataMove {
    pub fn new(meta: DataMoveMetadata) -> Self {
        let cancelled = meta.cancelled;
        Self {
            meta,
            valid: !cancelled,
            cancelled,
        }
    }

    /// Cross-check one shard-map entry against this move. Any disagreement
    /// flips the move to cancelled so resume schedules a cancellation
    /// instead of re-running a move the map no longer describes.
    pub fn validate_shard(&mut self, assignment: &ShardAssignment, range: &KeyRange) {
        if !self.valid {
            if assignment.has_dest() && assignment.dest_id.is_some() {
                error!(
                    range = ?range,
                    dest_id = ?assignment.dest_id,
                    "shard map names a data move with no metadata row"
                );
            }
            return;
        }
        debug_assert!(
            !self.meta.ranges.is_empty() && self.meta.ranges[0].contains(range),
            "validated range outside the move"
        );

        if !assignment.has_dest() {
            warn!(range = ?range, move_id = %self.meta.id, "shard lost its move destination");
            self.cancelled = true;
            return;
        }
        if assignment.dest_id != Some(self.meta.id) {
            warn!(
                range = ?range,
                move_id = %self.meta.id,
                shard_move_id = ?assignment.dest_id,
                "shard map disagrees on the move id"
            );
            self.cancelled = true;
            return;
        }
        if assignment.dest_primary != self.meta.primary_dest
            || assignment.dest_remote != self.meta.remote_dest
        {
            error!(
                range = ?range,
                move_id = %self.meta.id,
                "shard map disagrees on the move destination"
            );
            self.cancelled = true;
        }
    }
}

struct Pending {
    priority: i32,
    seq: u64,
    attempts: u32,
    rs: RelocateShard,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first; ties run in arrival order.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct RelocationQueue {
    store: Arc<SystemStore>,
    lock: MoveKeysLock,
    enabled: Arc<DdEnabledState>,
    knobs: Knobs,
    teams: Arc<Mutex<TeamCollection>>,
    remote_teams: Option<Arc<Mutex<TeamCollection>>>,
    registry: Arc<Mutex<ShardRegistry>>,
}

impl RelocationQueue {
    pub fn new(
        store: Arc<SystemStore>,
        lock: MoveKeysLock,
        enabled: Arc<DdEnabledState>,
        knobs: Knobs,
        teams: Arc<Mutex<TeamCollection>>,
        remote_teams: Option<Arc<Mutex<TeamCollection>>>,
        registry: Arc<Mutex<ShardRegistry>>,
    ) -> Self {
        Self {
            store,
            lock,
            enabled,
            knobs,
            teams,
            remote_teams,
            registry,
        }
    }

    /// Drain relocations until the producer side closes, then finish the
    /// backlog. Expected control errors (lock conflict, no destination team)
    /// propagate to restart the distributor.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<RelocateShard>,
    ) -> Result<()> {
        let mut pending: BinaryHeap<Pending> = BinaryHeap::new();
        let mut active: Vec<KeyRange> = Vec::new();
        let mut running: JoinSet<(KeyRange, u32, Result<()>)> = JoinSet::new();
        let mut next_seq = 0u64;
        let mut closed = false;

        loop {
            // Launch every eligible pending relocation up to the cap.
            let mut skipped = Vec::new();
            while running.len() < self.knobs.dd_move_keys_parallelism {
                let Some(item) = pending.pop() else { break };
                if active.iter().any(|r| r.overlaps(&item.rs.keys)) {
                    skipped.push(item);
                    continue;
                }
                active.push(item.rs.keys.clone());
                let queue = Arc::clone(&self);
                let keys = item.rs.keys.clone();
                let attempts = item.attempts;
                let rs = item.rs;
                running.spawn(async move {
                    let result = queue.execute_relocation(&rs).await;
                    (keys, attempts, result)
                });
            }
            pending.extend(skipped);

            if closed && running.is_empty() && pending.is_empty() {
                return Ok(());
            }

            tokio::select! {
                received = rx.recv(), if !closed => {
                    match received {
                        Some(rs) => {
                            pending.push(Pending {
                                priority: rs.priority,
                                seq: next_seq,
                                attempts: 0,
                                rs,
                            });
                            next_seq += 1;
                        }
                        None => closed = true,
                    }
                }
                finished = running.join_next(), if !running.is_empty() => {
                    let Some(joined) = finished else { continue };
                    let (keys, attempts, result) = match joined {
                        Ok(done) => done,
                        Err(join_err) if join_err.is_cancelled() => continue,
                        Err(join_err) => {
                            return Err(Error::Internal(format!(
                                "relocation task panicked: {join_err}"
                            )))
                        }
                    };
                    active.retain(|r| r != &keys);
                    match result {
                        Ok(()) => {}
                        Err(err) if err.is_expected_control() => return Err(err),
                        Err(err) => {
                            if attempts + 1 >= self.knobs.relocation_max_attempts {
                                error!(range = ?keys, error = %err, "relocation exhausted retries");
                                return Err(Error::DataMoveCancelled);
                            }
                            warn!(range = ?keys, error = %err, attempt = attempts + 1, "relocation failed, requeueing");
                            tokio::time::sleep(self.knobs.relocation_retry_delay).await;
                            pending.push(Pending {
                                priority: PRIORITY_RECOVER_MOVE,
                                seq: next_seq,
                                attempts: attempts + 1,
                                rs: RelocateShard {
                                    keys,
                                    priority: PRIORITY_RECOVER_MOVE,
                                    reason: crate::tracker::RelocateReason::RecoverMove,
                                    data_move_id: None,
                                    cancelled: false,
                                },
                            });
                            next_seq += 1;
                        }
                    }
                }
            }
        }
    }

    async fn execute_relocation(&self, rs: &RelocateShard) -> Result<()> {
        if rs.cancelled {
            self.execute_cancellation(rs).await
        } else {
            self.execute_move(rs).await
        }
    }

    async fn execute_move(&self, rs: &RelocateShard) -> Result<()> {
        let (dest_primary, dest_remote) = {
            let avoid = HashSet::new();
            let primary = self
                .teams
                .lock()
                .unwrap()
                .pick_destination_team(&avoid)
                .ok_or(Error::DestTeamNotFound)?;
            let remote = match &self.remote_teams {
                Some(tc) => tc
                    .lock()
                    .unwrap()
                    .pick_destination_team(&avoid)
                    .ok_or(Error::DestTeamNotFound)?
                    .servers,
                None => Vec::new(),
            };
            (primary.servers, remote)
        };
        let move_id = rs.data_move_id.unwrap_or_else(Uid::new_v4);

        // Persist intent first: the move row and the shard map destination
        // commit together, so a crash leaves them in agreement.
        {
            let dest_primary = dest_primary.clone();
            let dest_remote = dest_remote.clone();
            let keys_range = rs.keys.clone();
            self.store
                .run_txn(move |tr| {
                    check_move_keys_lock(tr, &self.lock, &self.enabled, true)?;
                    let meta = DataMoveMetadata {
                        id: move_id,
                        ranges: vec![keys_range.clone()],
                        primary_dest: dest_primary.clone(),
                        remote_dest: dest_remote.clone(),
                        cancelled: false,
                    };
                    tr.set(&keys::data_move_key(move_id), &serde_json::to_vec(&meta)?);
                    for entry in rangemap_get(tr, &keys::key_servers_prefix(), &keys_range) {
                        let mut assignment = ShardAssignment::decode(&entry.value);
                        assignment.dest_id = Some(move_id);
                        assignment.dest_primary = dest_primary.clone();
                        assignment.dest_remote = dest_remote.clone();
                        rangemap_set(
                            tr,
                            &keys::key_servers_prefix(),
                            &entry.range,
                            &assignment.encode(),
                        );
                    }
                    Ok(())
                })
                .await?;
        }

        // Register the destination so a team failure mid-move relocates the
        // range again.
        {
            let mut registry = self.registry.lock().unwrap();
            let mut teams = vec![TeamRef {
                servers: dest_primary.clone(),
                primary: true,
            }];
            if !dest_remote.is_empty() {
                teams.push(TeamRef {
                    servers: dest_remote.clone(),
                    primary: false,
                });
            }
            registry.move_shard(&rs.keys, teams);
        }

        // Ownership handoff: the destination becomes the source and the move
        // row is retired in the same transaction.
        {
            let dest_primary = dest_primary.clone();
            let dest_remote = dest_remote.clone();
            let keys_range = rs.keys.clone();
            self.store
                .run_txn(move |tr| {
                    check_move_keys_lock(tr, &self.lock, &self.enabled, true)?;
                    let assignment = ShardAssignment {
                        src_primary: dest_primary.clone(),
                        src_remote: dest_remote.clone(),
                        dest_id: None,
                        dest_primary: Vec::new(),
                        dest_remote: Vec::new(),
                    };
                    rangemap_set(
                        tr,
                        &keys::key_servers_prefix(),
                        &keys_range,
                        &assignment.encode(),
                    );
                    tr.clear(&keys::data_move_key(move_id));
                    Ok(())
                })
                .await?;
        }

        info!(
            range = ?rs.keys,
            move_id = %move_id,
            priority = rs.priority,
            dest = ?dest_primary,
            "relocation complete"
        );
        Ok(())
    }

    /// Undo a move: strip its destination from the shard map and tombstone
    /// the row for background cleanup.
    async fn execute_cancellation(&self, rs: &RelocateShard) -> Result<()> {
        let move_id = rs.data_move_id;
        let keys_range = rs.keys.clone();
        self.store
            .run_txn(move |tr| {
                check_move_keys_lock(tr, &self.lock, &self.enabled, true)?;
                for entry in rangemap_get(tr, &keys::key_servers_prefix(), &keys_range) {
                    let mut assignment = ShardAssignment::decode(&entry.value);
                    if move_id.is_some() && assignment.dest_id != move_id {
                        continue;
                    }
                    assignment.dest_id = None;
                    assignment.dest_primary = Vec::new();
                    assignment.dest_remote = Vec::new();
                    rangemap_set(
                        tr,
                        &keys::key_servers_prefix(),
                        &entry.range,
                        &assignment.encode(),
                    );
                }
                if let Some(id) = move_id {
                    if let Some(row) = tr.get(&keys::data_move_key(id)) {
                        let mut meta: DataMoveMetadata = serde_json::from_slice(&row)?;
                        meta.cancelled = true;
                        tr.set(&keys::data_move_key(id), &serde_json::to_vec(&meta)?);
                    }
                }
                Ok(())
            })
            .await?;
        info!(range = ?rs.keys, move_id = ?rs.data_move_id, "data move cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uid {
        Uid::from_u128(n as u128)
    }

    fn meta(id: Uid) -> DataMoveMetadata {
        DataMoveMetadata {
            id,
            ranges: vec![KeyRange::new(b"a".to_vec(), b"m".to_vec())],
            primary_dest: vec![uid(1), uid(2)],
            remote_dest: vec![],
            cancelled: false,
        }
    }

    #[test]
    fn pending_orders_by_priority_then_arrival() {
        let mut heap = BinaryHeap::new();
        for (priority, seq) in [(100, 0), (900, 1), (100, 2), (900, 3)] {
            heap.push(Pending {
                priority,
                seq,
                attempts: 0,
                rs: RelocateShard::new(
                    KeyRange::all(),
                    priority,
                    crate::tracker::RelocateReason::Other,
                ),
            });
        }
        let order: Vec<(i32, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|p| (p.priority, p.seq))
            .collect();
        assert_eq!(order, vec![(900, 1), (900, 3), (100, 0), (100, 2)]);
    }

    #[test]
    fn validate_shard_accepts_matching_assignment() {
        let id = uid(9);
        let mut mv = DataMove::new(meta(id));
        let assignment = ShardAssignment {
            src_primary: vec![uid(3)],
            src_remote: vec![],
            dest_id: Some(id),
            dest_primary: vec![uid(1), uid(2)],
            dest_remote: vec![],
        };
        mv.validate_shard(&assignment, &KeyRange::new(b"a".to_vec(), b"m".to_vec()));
        assert!(!mv.cancelled);
    }

    #[test]
    fn validate_shard_cancels_on_id_mismatch() {
        let mut mv = DataMove::new(meta(uid(9)));
        let assignment = ShardAssignment {
            src_primary: vec![uid(3)],
            src_remote: vec![],
            dest_id: Some(uid(8)),
            dest_primary: vec![uid(1), uid(2)],
            dest_remote: vec![],
        };
        mv.validate_shard(&assignment, &KeyRange::new(b"a".to_vec(), b"m".to_vec()));
        assert!(mv.cancelled);
    }

    #[test]
    fn validate_shard_cancels_on_missing_dest() {
        let mut mv = DataMove::new(meta(uid(9)));
        let assignment = ShardAssignment {
            src_primary: vec![uid(3)],
            ..Default::default()
        };
        mv.validate_shard(&assignment, &KeyRange::new(b"a".to_vec(), b"m".to_vec()));
        assert!(mv.cancelled);
    }

    #[test]
    fn validate_shard_cancels_on_dest_mismatch() {
        let id = uid(9);
        let mut mv = DataMove::new(meta(id));
        let assignment = ShardAssignment {
            src_primary: vec![uid(3)],
            src_remote: vec![],
            dest_id: Some(id),
            dest_primary: vec![uid(7)],
            dest_remote: vec![],
        };
        mv.validate_shard(&assignment, &KeyRange::new(b"a".to_vec(), b"m".to_vec()));
        assert!(mv.cancelled);
    }
}
