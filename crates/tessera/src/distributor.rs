//! Distributor bootstrap, lifecycle, and request dispatch.
//!
//! The lifecycle loop: wait until distribution is enabled, take the
//! move-keys lock, initialize audit metadata, trap the security-quiesce
//! mode, load the configuration and a consistent snapshot of the shard map
//! and in-flight moves, resume them, then run the steady-state actors
//! (tracker, relocation queue, team collections, monitors). Expected control
//! errors unwind everything and restart from the top; anything else kills
//! the distributor and the cluster controller respawns a fresh instance
//! that wins the lock exchange.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audit::AuditEngine;
use crate::error::{Error, Result};
use crate::keys;
use crate::knobs::{Knobs, PRIORITY_RECOVER_MOVE, PRIORITY_TEAM_UNHEALTHY};
use crate::lock::{poll_move_keys_lock, take_move_keys_lock, MoveKeysLock};
use crate::physical_shard::{physical_shard_id, PhysicalShardCollection};
use crate::queue::{read_data_moves, DataMove, DataMoveMetadata, RelocationQueue, ShardAssignment};
use crate::snapshot::{DdEnabledState, SnapshotManager};
use crate::store::{rangemap_get, rangemap_init, rangemap_set, SystemStore, Transaction};
use crate::teams::{read_server_list, resolve_exclusions, TeamCollection};
use crate::tracker::{RelocateReason, RelocateShard, ShardMetrics, ShardRegistry, ShardTracker, TeamRef};
use crate::transport::ClusterTransport;
use crate::{AuditType, KeyRange, Uid};

const STORAGE_WIGGLE_INTERVAL: Duration = Duration::from_secs(60);

/// Cluster configuration as the distributor reads it at bootstrap.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub storage_team_size: usize,
    pub usable_regions: usize,
    /// Datacenter ids, primary first.
    pub regions: Vec<String>,
    pub storage_engine: String,
}

pub fn load_database_config(tr: &mut Transaction<'_>) -> DatabaseConfig {
    fn int_option(tr: &mut Transaction<'_>, name: &str, default: usize) -> usize {
        tr.get(&keys::config_key(name))
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
    let regions = tr
        .get(&keys::config_key("regions"))
        .and_then(|v| serde_json::from_slice::<Vec<String>>(&v).ok())
        .unwrap_or_default();
    let storage_engine = tr
        .get(&keys::config_key("storage_engine"))
        .and_then(|v| String::from_utf8(v).ok())
        .unwrap_or_else(|| "ssd-2".to_string());
    DatabaseConfig {
        storage_team_size: int_option(tr, "storage_team_size", 1),
        usable_regions: int_option(tr, "usable_regions", 1),
        regions,
        storage_engine,
    }
}

fn read_dd_mode(tr: &mut Transaction<'_>) -> u8 {
    tr.get(&keys::dd_mode_key())
        .and_then(|v| v.first().copied())
        .unwrap_or(1)
}

/// One shard of the initial distribution snapshot.
#[derive(Clone, Debug)]
pub struct InitialShard {
    pub range: KeyRange,
    pub assignment: ShardAssignment,
}

/// Consistent bootstrap snapshot: shard map, in-flight data moves, and
/// per-range replication overrides, all read in one transaction.
#[derive(Clone, Debug, Default)]
pub struct InitialDistribution {
    pub shards: Vec<InitialShard>,
    pub data_moves: Vec<DataMoveMetadata>,
    pub replication_overrides: Vec<(KeyRange, usize)>,
}

pub fn load_initial_distribution(tr: &mut Transaction<'_>) -> Result<InitialDistribution> {
    let map_prefix = keys::key_servers_prefix();
    let mut entries = rangemap_get(tr, &map_prefix, &KeyRange::all());
    if entries.len() == 1 && entries[0].value.is_empty() {
        // Fresh cluster: seed the map so every key has an assignment row.
        rangemap_init(tr, &map_prefix, &ShardAssignment::default().encode());
        entries = rangemap_get(tr, &map_prefix, &KeyRange::all());
    }
    let shards = entries
        .into_iter()
        .map(|e| InitialShard {
            assignment: ShardAssignment::decode(&e.value),
            range: e.range,
        })
        .collect();

    let data_moves = read_data_moves(tr)?;

    let mut replication_overrides = Vec::new();
    for entry in rangemap_get(tr, &keys::user_range_config_prefix(), &KeyRange::all()) {
        if entry.value.is_empty() {
            continue;
        }
        if let Some(factor) = String::from_utf8(entry.value.clone())
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            replication_overrides.push((entry.range, factor));
        }
    }

    Ok(InitialDistribution {
        shards,
        data_moves,
        replication_overrides,
    })
}

/// Walk the initial shards: register each with the failure registry and
/// enqueue recovery relocations for under-replicated shards and for shards
/// already carrying an anonymous in-flight destination.
pub fn resume_from_shards(
    initial: &InitialDistribution,
    config: &DatabaseConfig,
    knobs: &Knobs,
    registry: &mut ShardRegistry,
    output: &mpsc::UnboundedSender<RelocateShard>,
) -> Result<()> {
    let mut overreplicated = 0usize;
    for shard in &initial.shards {
        let custom_replicas = initial
            .replication_overrides
            .iter()
            .filter(|(range, _)| range.overlaps(&shard.range))
            .map(|(_, factor)| *factor)
            .max()
            .map(|factor| factor.max(config.storage_team_size))
            .unwrap_or(config.storage_team_size);

        let mut teams = vec![TeamRef {
            servers: shard.assignment.src_primary.clone(),
            primary: true,
        }];
        if config.usable_regions > 1 {
            teams.push(TeamRef {
                servers: shard.assignment.src_remote.clone(),
                primary: false,
            });
        }
        registry.define_shard(&shard.range);
        registry.move_shard(&shard.range, teams);

        let mut unhealthy = shard.assignment.src_primary.len() != custom_replicas;
        if !unhealthy && config.usable_regions > 1 {
            unhealthy = shard.assignment.src_remote.len() != custom_replicas;
        }
        if !unhealthy && shard.assignment.src_primary.len() > config.storage_team_size {
            overreplicated += 1;
            if overreplicated > knobs.dd_max_shards_on_large_teams {
                unhealthy = true;
            }
        }

        let anonymous_inflight = shard.assignment.has_dest() && shard.assignment.dest_id.is_none();
        if unhealthy {
            let _ = output.send(RelocateShard::new(
                shard.range.clone(),
                PRIORITY_TEAM_UNHEALTHY,
                RelocateReason::TeamUnhealthy,
            ));
        } else if anonymous_inflight {
            // The move is already in flight with no metadata to resume from;
            // schedule it again at low priority.
            let _ = output.send(RelocateShard::new(
                shard.range.clone(),
                PRIORITY_RECOVER_MOVE,
                RelocateReason::RecoverMove,
            ));
        }
    }
    Ok(())
}

/// Re-emit persisted data moves: valid moves restart with their recorded
/// destination registered; cancelled or unresumable moves get a
/// cancellation relocation. Returns ids whose tombstones want cleanup.
pub fn resume_from_data_moves(
    initial: &InitialDistribution,
    knobs: &Knobs,
    registry: &mut ShardRegistry,
    output: &mpsc::UnboundedSender<RelocateShard>,
) -> Result<Vec<Uid>> {
    let mut tombstones = Vec::new();
    for meta in &initial.data_moves {
        if meta.ranges.is_empty() {
            info!(move_id = %meta.id, "skipping data move with no ranges");
            continue;
        }
        let mut mv = DataMove::new(meta.clone());
        if mv.valid {
            for shard in &initial.shards {
                if meta.ranges[0].contains(&shard.range) {
                    mv.validate_shard(&shard.assignment, &shard.range);
                }
            }
        }

        if mv.cancelled || (mv.valid && !knobs.shard_encode_location_metadata) {
            let mut rs = RelocateShard::new(
                meta.ranges[0].clone(),
                PRIORITY_RECOVER_MOVE,
                RelocateReason::RecoverMove,
            );
            rs.data_move_id = Some(meta.id);
            rs.cancelled = true;
            let _ = output.send(rs);
            if meta.cancelled {
                tombstones.push(meta.id);
            }
            debug!(move_id = %meta.id, "scheduled data move cancellation at resume");
        } else if mv.valid {
            let mut teams = vec![TeamRef {
                servers: meta.primary_dest.clone(),
                primary: true,
            }];
            if !meta.remote_dest.is_empty() {
                teams.push(TeamRef {
                    servers: meta.remote_dest.clone(),
                    primary: false,
                });
            }
            registry.define_shard(&meta.ranges[0]);
            registry.move_shard(&meta.ranges[0], teams);

            let mut rs = RelocateShard::new(
                meta.ranges[0].clone(),
                PRIORITY_RECOVER_MOVE,
                RelocateReason::RecoverMove,
            );
            rs.data_move_id = Some(meta.id);
            let _ = output.send(rs);
            debug!(move_id = %meta.id, "resumed data move");
        }
    }
    Ok(tombstones)
}

pub struct MetricsReply {
    pub shards: Vec<ShardMetrics>,
    pub mid_shard_size: Option<i64>,
}

pub struct WigglerStateReply {
    pub primary_queue: usize,
    pub remote_queue: Option<usize>,
    pub last_state_change_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareBlobRestoreReply {
    Success,
    ConflictBlobRestore,
    ConflictSnapshot,
}

/// Requests served by the distributor's dispatch loop.
pub enum DistributorRequest {
    Halt {
        requester: Uid,
        reply: oneshot::Sender<()>,
    },
    GetMetrics {
        keys: KeyRange,
        shard_limit: usize,
        mid_only: bool,
        reply: oneshot::Sender<Result<MetricsReply>>,
    },
    Snapshot {
        payload: Vec<u8>,
        uid: Uid,
        reply: oneshot::Sender<Result<()>>,
    },
    ExclusionSafetyCheck {
        exclusions: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
    WigglerState {
        reply: oneshot::Sender<Result<WigglerStateReply>>,
    },
    TriggerAudit {
        range: KeyRange,
        audit_type: AuditType,
        cancel: bool,
        id: Option<u64>,
        reply: oneshot::Sender<Result<u64>>,
    },
    TenantsOverStorageQuota {
        reply: oneshot::Sender<Result<Vec<i64>>>,
    },
    PrepareBlobRestore {
        keys: KeyRange,
        server: Uid,
        requester: Uid,
        reply: oneshot::Sender<PrepareBlobRestoreReply>,
    },
}

/// Live per-generation state shared with the dispatch loop.
struct ActiveState {
    lock: MoveKeysLock,
    audit: Arc<AuditEngine>,
    tracker: Arc<Mutex<ShardTracker>>,
    registry: Arc<Mutex<ShardRegistry>>,
    teams: Arc<Mutex<TeamCollection>>,
    remote_teams: Option<Arc<Mutex<TeamCollection>>>,
}

impl Drop for ActiveState {
    fn drop(&mut self) {
        // Audit cores are free-running tasks; without this they would keep
        // writing under a lock the next generation is about to replace.
        self.audit.cancel_all();
    }
}

pub struct Distributor {
    pub id: Uid,
    store: Arc<SystemStore>,
    transport: Arc<dyn ClusterTransport>,
    knobs: Knobs,
    enabled: Arc<DdEnabledState>,
    active: RwLock<Option<Arc<ActiveState>>>,
    restart_tx: watch::Sender<u64>,
    failed_server_tx: watch::Sender<Option<Uid>>,
}

impl Distributor {
    pub fn new(
        store: Arc<SystemStore>,
        transport: Arc<dyn ClusterTransport>,
        knobs: Knobs,
    ) -> Arc<Self> {
        let (restart_tx, _) = watch::channel(0);
        let (failed_server_tx, _) = watch::channel(None);
        Arc::new(Self {
            id: Uid::new_v4(),
            store,
            transport,
            knobs,
            enabled: Arc::new(DdEnabledState::new()),
            active: RwLock::new(None),
            restart_tx,
            failed_server_tx,
        })
    }

    pub fn enabled_state(&self) -> Arc<DdEnabledState> {
        Arc::clone(&self.enabled)
    }

    /// Force a lifecycle restart, as a configuration change would.
    pub fn signal_config_change(&self) {
        self.restart_tx.send_modify(|v| *v += 1);
    }

    /// Ask the lifecycle loop to drain a failed server's key ownership onto
    /// a healthy team and restart.
    pub fn signal_failed_server(&self, server: Uid) {
        let _ = self.failed_server_tx.send(Some(server));
    }

    /// Feed a shard metrics observation into the live tracker (the storage
    /// fleet's metric reports arrive through this surface).
    pub fn report_shard_metrics(&self, range: &KeyRange, bytes: u64, write_bytes_per_sec: u64) {
        if let Some(active) = self.active.read().unwrap().clone() {
            active
                .tracker
                .lock()
                .unwrap()
                .update_shard_metrics(range, bytes, write_bytes_per_sec);
        }
    }

    /// Serve requests until halted. The lifecycle loop runs underneath and
    /// restarts itself on expected control errors; its fatal errors end this
    /// call.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<DistributorRequest>,
    ) -> Result<()> {
        info!(dd_id = %self.id, "distributor starting");
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.knobs.clone(),
            Arc::clone(&self.enabled),
        ));

        let lifecycle_self = Arc::clone(&self);
        let mut lifecycle = tokio::spawn(async move { lifecycle_self.data_distribution().await });

        let result = loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(DistributorRequest::Halt { requester, reply }) => {
                        info!(dd_id = %self.id, requester = %requester, "distributor halted");
                        let _ = reply.send(());
                        break Ok(());
                    }
                    Some(request) => self.serve(request, &snapshots),
                    None => break Ok(()),
                },
                finished = &mut lifecycle => {
                    break match finished {
                        Ok(result) => result,
                        Err(join_err) => Err(Error::Internal(format!(
                            "lifecycle task died: {join_err}"
                        ))),
                    };
                }
            }
        };
        lifecycle.abort();
        *self.active.write().unwrap() = None;
        result
    }

    fn serve(self: &Arc<Self>, request: DistributorRequest, snapshots: &Arc<SnapshotManager>) {
        match request {
            DistributorRequest::Halt { .. } => unreachable!("handled by the dispatch loop"),
            DistributorRequest::GetMetrics {
                keys,
                shard_limit,
                mid_only,
                reply,
            } => {
                let result = match self.active.read().unwrap().clone() {
                    Some(active) => {
                        let tracker = active.tracker.lock().unwrap();
                        if mid_only {
                            Ok(MetricsReply {
                                shards: Vec::new(),
                                mid_shard_size: Some(tracker.median_shard_size(&keys)),
                            })
                        } else {
                            Ok(MetricsReply {
                                shards: tracker.get_metrics(&keys, shard_limit),
                                mid_shard_size: None,
                            })
                        }
                    }
                    None => Err(Error::OperationFailed),
                };
                let _ = reply.send(result);
            }
            DistributorRequest::Snapshot { payload, uid, reply } => {
                let snapshots = Arc::clone(snapshots);
                tokio::spawn(async move {
                    let _ = reply.send(snapshots.handle(payload, uid).await);
                });
            }
            DistributorRequest::ExclusionSafetyCheck { exclusions, reply } => {
                let safe = match self.active.read().unwrap().clone() {
                    Some(active) => {
                        let dist = Arc::clone(self);
                        tokio::spawn(async move {
                            let servers = dist
                                .store
                                .run_txn(read_server_list)
                                .await
                                .unwrap_or_default();
                            let ids = resolve_exclusions(&servers, &exclusions);
                            let safe = active.teams.lock().unwrap().exclusion_safety_check(&ids);
                            let _ = reply.send(safe);
                        });
                        return;
                    }
                    None => false,
                };
                let _ = reply.send(safe);
            }
            DistributorRequest::WigglerState { reply } => {
                let result = match self.active.read().unwrap().clone() {
                    Some(active) => {
                        let teams = active.teams.lock().unwrap();
                        let primary_queue = teams.wiggler.queue_len();
                        let mut last_change = teams.wiggler.last_state_change_ms();
                        drop(teams);
                        let remote_queue = active.remote_teams.as_ref().map(|tc| {
                            let tc = tc.lock().unwrap();
                            last_change = last_change.max(tc.wiggler.last_state_change_ms());
                            tc.wiggler.queue_len()
                        });
                        Ok(WigglerStateReply {
                            primary_queue,
                            remote_queue,
                            last_state_change_ms: last_change,
                        })
                    }
                    None => Err(Error::OperationFailed),
                };
                let _ = reply.send(result);
            }
            DistributorRequest::TriggerAudit {
                range,
                audit_type,
                cancel,
                id,
                reply,
            } => {
                let audit = match self.active.read().unwrap().clone() {
                    Some(active) => Arc::clone(&active.audit),
                    None => {
                        let _ = reply.send(Err(Error::AuditStorageFailed));
                        return;
                    }
                };
                tokio::spawn(async move {
                    let _ = reply.send(audit.handle_trigger(range, audit_type, cancel, id).await);
                });
            }
            DistributorRequest::TenantsOverStorageQuota { reply } => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    let _ = reply.send(crate::tenant::tenants_over_storage_quota(&store).await);
                });
            }
            DistributorRequest::PrepareBlobRestore {
                keys: _,
                server,
                requester,
                reply,
            } => {
                if self.enabled.same_id(requester) && self.enabled.is_blob_restore_preparing() {
                    // At-least-once sender; the admission already happened.
                    let _ = reply.send(PrepareBlobRestoreReply::Success);
                    return;
                }
                if self.enabled.try_set_blob_restore_preparing(requester) {
                    info!(
                        dd_id = %self.id,
                        requester = %requester,
                        server = %server,
                        "blob restore admitted, restarting distributor"
                    );
                    let _ = reply.send(PrepareBlobRestoreReply::Success);
                    self.signal_config_change();
                } else if self.enabled.is_blob_restore_preparing() {
                    let _ = reply.send(PrepareBlobRestoreReply::ConflictBlobRestore);
                } else {
                    let _ = reply.send(PrepareBlobRestoreReply::ConflictSnapshot);
                }
            }
        }
    }

    /// The restarting lifecycle loop.
    async fn data_distribution(self: Arc<Self>) -> Result<()> {
        loop {
            let result = self.run_generation().await;
            let failed_server = *self.failed_server_tx.borrow();

            // Tear down this generation's state, keeping what a failed-server
            // drain needs. On a clean unwind the maps drop off-thread; a
            // cancellation path drops them here.
            let state = self.active.write().unwrap().take();
            if let Some(server) = failed_server {
                let _ = self.failed_server_tx.send(None);
                let (team, ranges) = match &state {
                    Some(state) => (
                        state.teams.lock().unwrap().random_healthy_team(server),
                        state.registry.lock().unwrap().ranges_for_server(server),
                    ),
                    None => (None, Vec::new()),
                };
                if let Some(team) = team {
                    if let Err(err) = self.drain_failed_server(server, team, ranges).await {
                        warn!(server = %server, error = %err, "failed server drain incomplete");
                    }
                }
                if let Some(state) = state {
                    tokio::spawn(async move { drop(state) });
                }
                continue;
            }
            if let Some(state) = state {
                tokio::spawn(async move { drop(state) });
            }

            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_expected_control() => {
                    info!(dd_id = %self.id, error = %err, "distributor restarting");
                }
                Err(err) => {
                    warn!(dd_id = %self.id, error = %err, "distributor dying");
                    return Err(err);
                }
            }
        }
    }

    async fn run_generation(self: &Arc<Self>) -> Result<()> {
        let mut restart_rx = self.restart_tx.subscribe();
        let mut failed_rx = self.failed_server_tx.subscribe();
        let generation = self.run_generation_inner();
        tokio::select! {
            result = generation => result,
            _ = restart_rx.changed() => Err(Error::ConfigChanged),
            _ = failed_rx.changed() => Err(Error::ConfigChanged),
        }
    }

    async fn run_generation_inner(self: &Arc<Self>) -> Result<()> {
        // Wait until the persisted mode enables distribution.
        loop {
            let mode = self.store.run_txn(|tr| Ok(read_dd_mode(tr))).await?;
            if mode == 1 {
                break;
            }
            debug!(dd_id = %self.id, mode, "distribution disabled, waiting");
            tokio::time::sleep(self.knobs.dd_enabled_check_delay).await;
        }

        let lock = take_move_keys_lock(&self.store, self.id).await?;
        info!(dd_id = %self.id, "took move keys lock");

        // Audit metadata needs only the lock, not the configuration; resume
        // audits in parallel with the rest of bootstrap.
        let audit = AuditEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.knobs.clone(),
            Arc::clone(&self.enabled),
            self.id,
            lock,
        );
        let audit_init = {
            let audit = Arc::clone(&audit);
            tokio::spawn(async move { audit.init().await })
        };

        // Trap the security-quiesce mode before doing any data movement.
        loop {
            let mode = self.store.run_txn(|tr| Ok(read_dd_mode(tr))).await?;
            if mode != 2 {
                break;
            }
            self.store
                .run_txn(|tr| crate::lock::check_move_keys_lock(tr, &lock, &self.enabled, false))
                .await?;
            tokio::time::sleep(self.knobs.dd_enabled_check_delay).await;
        }

        let config = self.store.run_txn(|tr| Ok(load_database_config(tr))).await?;
        info!(dd_id = %self.id, config = ?config, "loaded database configuration");
        if config.storage_engine == "ssd-sharded-rocksdb" && !self.knobs.shard_encode_location_metadata
        {
            return Err(Error::Internal(
                "sharded storage engine requires encoded location metadata".into(),
            ));
        }

        let initial = self.store.run_txn(load_initial_distribution).await?;
        info!(
            dd_id = %self.id,
            shards = initial.shards.len(),
            data_moves = initial.data_moves.len(),
            "loaded initial distribution"
        );

        // Build the per-generation components.
        let registry = Arc::new(Mutex::new(ShardRegistry::new()));
        let (relocation_tx, relocation_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Mutex::new(ShardTracker::new(
            self.knobs.clone(),
            relocation_tx.clone(),
        )));
        {
            let mut tracker = tracker.lock().unwrap();
            for shard in &initial.shards {
                tracker.track_shard(&shard.range);
            }
        }

        let servers = self.store.run_txn(read_server_list).await?;
        let primary_dc = config.regions.first().cloned();
        let remote_dc = config.regions.get(1).cloned();
        let teams = Arc::new(Mutex::new(TeamCollection::new(
            true,
            config.storage_team_size,
            self.knobs.dd_storage_wiggle_min_ss_age,
        )));
        let remote_teams = if config.usable_regions > 1 {
            Some(Arc::new(Mutex::new(TeamCollection::new(
                false,
                config.storage_team_size,
                self.knobs.dd_storage_wiggle_min_ss_age,
            ))))
        } else {
            None
        };
        for server in servers {
            let in_primary = primary_dc
                .as_ref()
                .map(|dc| server.locality.dc == *dc)
                .unwrap_or(true);
            let in_remote = remote_dc
                .as_ref()
                .map(|dc| server.locality.dc == *dc)
                .unwrap_or(false);
            if in_primary {
                teams.lock().unwrap().add_server(server.clone());
            } else if in_remote {
                if let Some(remote) = &remote_teams {
                    remote.lock().unwrap().add_server(server.clone());
                }
            }
        }

        let physical_shards = Arc::new(PhysicalShardCollection::new());
        if self.knobs.shard_encode_location_metadata && self.knobs.enable_dd_physical_shard {
            for shard in &initial.shards {
                let id = shard
                    .assignment
                    .dest_id
                    .map(physical_shard_id)
                    .unwrap_or_default();
                let teams = vec![TeamRef {
                    servers: shard.assignment.src_primary.clone(),
                    primary: true,
                }];
                physical_shards.assign_range(id, &shard.range, teams);
            }
        }

        // Resume: shards first, then the persisted moves that cover them.
        {
            let mut registry = registry.lock().unwrap();
            resume_from_shards(&initial, &config, &self.knobs, &mut registry, &relocation_tx)?;
        }
        let tombstones = {
            let mut registry = registry.lock().unwrap();
            resume_from_data_moves(&initial, &self.knobs, &mut registry, &relocation_tx)?
        };
        if !tombstones.is_empty() {
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                let result = store
                    .run_txn(|tr| {
                        for id in &tombstones {
                            tr.clear(&keys::data_move_key(*id));
                        }
                        Ok(())
                    })
                    .await;
                if let Err(err) = result {
                    // Leftover tombstones are retried at the next restart.
                    warn!(error = %err, "data move tombstone cleanup failed");
                }
            });
        }

        let state = Arc::new(ActiveState {
            lock,
            audit: Arc::clone(&audit),
            tracker: Arc::clone(&tracker),
            registry: Arc::clone(&registry),
            teams: Arc::clone(&teams),
            remote_teams: remote_teams.clone(),
        });
        *self.active.write().unwrap() = Some(Arc::clone(&state));
        info!(dd_id = %self.id, "distributor initialized");

        // Steady-state actors. The first one to fail unwinds the generation.
        let mut actors: JoinSet<Result<()>> = JoinSet::new();

        let queue = Arc::new(RelocationQueue::new(
            Arc::clone(&self.store),
            state.lock,
            Arc::clone(&self.enabled),
            self.knobs.clone(),
            Arc::clone(&teams),
            remote_teams.clone(),
            Arc::clone(&registry),
        ));
        actors.spawn(async move { queue.run(relocation_rx).await });

        {
            let store = Arc::clone(&self.store);
            let enabled = Arc::clone(&self.enabled);
            let interval = self.knobs.movekeys_lock_polling_delay;
            let lock = state.lock;
            actors.spawn(async move { poll_move_keys_lock(&store, lock, &enabled, interval).await });
        }

        actors.spawn(async move {
            match audit_init.await {
                Ok(Ok(())) => {
                    // Initialized; the engine serves triggers from the map.
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::Internal("audit init task died".into())),
            }
        });

        if self.knobs.shard_encode_location_metadata && self.knobs.enable_dd_physical_shard {
            let monitor = Arc::clone(&physical_shards);
            let delay = self.knobs.physical_shard_metrics_delay;
            actors.spawn(async move {
                monitor.monitor(delay).await;
                Ok(())
            });
        }

        {
            let state = Arc::clone(&state);
            actors.spawn(async move {
                loop {
                    tokio::time::sleep(STORAGE_WIGGLE_INTERVAL).await;
                    let wiggled = state.teams.lock().unwrap().wiggle_next();
                    if let Some(server) = wiggled {
                        let ranges = state.registry.lock().unwrap().ranges_for_server(server);
                        state.tracker.lock().unwrap().relocate_for_team_failure(ranges);
                    }
                }
            });
        }

        let outcome = match actors.join_next().await {
            Some(Ok(result)) => result.and(Err(Error::Internal(
                "steady-state actor exited unexpectedly".into(),
            ))),
            Some(Err(join_err)) if join_err.is_cancelled() => Ok(()),
            Some(Err(join_err)) => Err(Error::Internal(format!("actor panicked: {join_err}"))),
            None => Ok(()),
        };
        actors.abort_all();
        outcome
    }

    /// Hand every range owned by a failed server to a randomly chosen
    /// healthy team before the lifecycle restarts.
    async fn drain_failed_server(
        self: &Arc<Self>,
        server: Uid,
        team: crate::teams::Team,
        ranges: Vec<KeyRange>,
    ) -> Result<()> {
        info!(server = %server, dest = ?team.servers, ranges = ranges.len(), "draining failed server");
        let store = Arc::clone(&self.store);
        store
            .run_txn(move |tr| {
                for range in &ranges {
                    for entry in rangemap_get(tr, &keys::key_servers_prefix(), range) {
                        let mut assignment = ShardAssignment::decode(&entry.value);
                        if !assignment.src_primary.contains(&server) {
                            continue;
                        }
                        assignment.src_primary = team.servers.clone();
                        rangemap_set(
                            tr,
                            &keys::key_servers_prefix(),
                            &entry.range,
                            &assignment.encode(),
                        );
                    }
                }
                tr.clear(&keys::server_list_key(server));
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(src: &[u8], dest: Option<&[u8]>) -> ShardAssignment {
        ShardAssignment {
            src_primary: src.iter().map(|n| Uid::from_u128(*n as u128)).collect(),
            src_remote: Vec::new(),
            dest_id: None,
            dest_primary: dest
                .map(|d| d.iter().map(|n| Uid::from_u128(*n as u128)).collect())
                .unwrap_or_default(),
            dest_remote: Vec::new(),
        }
    }

    fn double_to_test_key(d: f64) -> Vec<u8> {
        format!("{:016.8}", d).into_bytes()
    }

    #[test]
    fn resume_from_shards_reschedules_anonymous_inflight_moves() {
        let knobs = Knobs::default();
        let config = DatabaseConfig {
            storage_team_size: 1,
            usable_regions: 1,
            regions: Vec::new(),
            storage_engine: "ssd-2".to_string(),
        };

        let parallelism = knobs.dd_move_keys_parallelism;
        let shard_count = parallelism + 25;
        let mut shards = Vec::new();
        for i in 0..shard_count {
            let begin = double_to_test_key(i as f64 + 1.0);
            let end = if i + 1 == shard_count {
                crate::keys::USER_KEYSPACE_END.to_vec()
            } else {
                double_to_test_key(i as f64 + 2.0)
            };
            let has_dest = i < parallelism;
            shards.push(InitialShard {
                range: KeyRange::new(begin, end),
                assignment: assignment(&[i as u8 + 1], has_dest.then_some(&[i as u8 + 2][..])),
            });
        }
        let initial = InitialDistribution {
            shards: shards.clone(),
            data_moves: Vec::new(),
            replication_overrides: Vec::new(),
        };

        let mut registry = ShardRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        resume_from_shards(&initial, &config, &knobs, &mut registry, &tx).expect("resume");

        for i in 0..parallelism {
            let rs = rx.try_recv().expect("expected a recovery relocation");
            assert_eq!(rs.priority, PRIORITY_RECOVER_MOVE);
            assert!(!rs.cancelled);
            assert!(rs.data_move_id.is_none());
            assert_eq!(rs.keys.begin, shards[i].range.begin);
            assert_eq!(rs.keys.end, shards[i].range.end);
        }
        assert!(rx.try_recv().is_err(), "only dest-carrying shards relocate");
    }

    #[test]
    fn resume_from_shards_relocates_underreplicated_shards() {
        let knobs = Knobs::default();
        let config = DatabaseConfig {
            storage_team_size: 2,
            usable_regions: 1,
            regions: Vec::new(),
            storage_engine: "ssd-2".to_string(),
        };
        let initial = InitialDistribution {
            shards: vec![InitialShard {
                range: KeyRange::all(),
                assignment: assignment(&[1], None),
            }],
            data_moves: Vec::new(),
            replication_overrides: Vec::new(),
        };
        let mut registry = ShardRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        resume_from_shards(&initial, &config, &knobs, &mut registry, &tx).expect("resume");

        let rs = rx.try_recv().expect("under-replicated shard relocates");
        assert_eq!(rs.priority, PRIORITY_TEAM_UNHEALTHY);
    }

    #[test]
    fn resume_from_data_moves_cancels_invalidated_moves() {
        let knobs = Knobs::default();
        let move_id = Uid::from_u128(77);
        let range = KeyRange::new(b"a".to_vec(), b"m".to_vec());
        let initial = InitialDistribution {
            shards: vec![InitialShard {
                range: range.clone(),
                // The shard map lost the destination: the move is stale.
                assignment: assignment(&[1], None),
            }],
            data_moves: vec![DataMoveMetadata {
                id: move_id,
                ranges: vec![range.clone()],
                primary_dest: vec![Uid::from_u128(2)],
                remote_dest: Vec::new(),
                cancelled: false,
            }],
            replication_overrides: Vec::new(),
        };
        let mut registry = ShardRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        resume_from_data_moves(&initial, &knobs, &mut registry, &tx).expect("resume");

        let rs = rx.try_recv().expect("cancellation scheduled");
        assert!(rs.cancelled);
        assert_eq!(rs.data_move_id, Some(move_id));
        assert_eq!(rs.priority, PRIORITY_RECOVER_MOVE);
    }
}
