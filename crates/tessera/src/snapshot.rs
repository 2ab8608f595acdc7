//! Cluster snapshot orchestration.
//!
//! A snapshot quiesces the cluster around a consistent cut: set the recovery
//! flag, stop tlog pops, snapshot storage servers first, then tlogs, re-enable
//! pops, then coordinators, and clear the flag. Each role has its own fault
//! tolerance. Requests are deduplicated by uid: a finished result is replayed
//! for a retention window, and a duplicate of an in-flight request waits on
//! the same outcome instead of re-driving the snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::keys;
use crate::knobs::Knobs;
use crate::store::SystemStore;
use crate::teams::read_server_list;
use crate::transport::ClusterTransport;
use crate::Uid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerRole {
    Storage,
    TLog,
    Coordinator,
}

/// A stateful worker process (tlog rows under the tlog list prefix).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: Uid,
    pub addr: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DdGate {
    Enabled,
    SnapshotPending,
    BlobRestorePreparing,
}

/// In-memory gate that stops the distributor from moving data while a
/// snapshot or blob restore owns the cluster. The owner uid makes the
/// enable/disable handshake idempotent per requester.
pub struct DdEnabledState {
    inner: Mutex<(DdGate, Uid)>,
}

impl Default for DdEnabledState {
    fn default() -> Self {
        Self::new()
    }
}

impl DdEnabledState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((DdGate::Enabled, Uid::nil())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().0 == DdGate::Enabled
    }

    pub fn is_blob_restore_preparing(&self) -> bool {
        self.inner.lock().unwrap().0 == DdGate::BlobRestorePreparing
    }

    pub fn is_snapshotting(&self) -> bool {
        self.inner.lock().unwrap().0 == DdGate::SnapshotPending
    }

    pub fn same_id(&self, uid: Uid) -> bool {
        self.inner.lock().unwrap().1 == uid
    }

    pub fn try_set_snapshot(&self, uid: Uid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.0 != DdGate::Enabled {
            return false;
        }
        *inner = (DdGate::SnapshotPending, uid);
        true
    }

    pub fn try_set_blob_restore_preparing(&self, uid: Uid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.0 != DdGate::Enabled {
            return false;
        }
        *inner = (DdGate::BlobRestorePreparing, uid);
        true
    }

    /// Re-enable, allowed only for the current owner (or when already
    /// enabled).
    pub fn try_set_enabled(&self, uid: Uid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.0 == DdGate::Enabled {
            return true;
        }
        if inner.1 != uid {
            return false;
        }
        *inner = (DdGate::Enabled, Uid::nil());
        true
    }
}

pub struct SnapshotManager {
    store: Arc<SystemStore>,
    transport: Arc<dyn ClusterTransport>,
    knobs: Knobs,
    enabled: Arc<DdEnabledState>,
    inflight: Mutex<HashMap<Uid, watch::Receiver<Option<Result<()>>>>>,
    results: Mutex<HashMap<Uid, Result<()>>>,
}

impl SnapshotManager {
    pub fn new(
        store: Arc<SystemStore>,
        transport: Arc<dyn ClusterTransport>,
        knobs: Knobs,
        enabled: Arc<DdEnabledState>,
    ) -> Self {
        Self {
            store,
            transport,
            knobs,
            enabled,
            inflight: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Serve one snapshot request. Duplicate uids never re-drive the
    /// snapshot inside the retention window.
    pub async fn handle(self: &Arc<Self>, payload: Vec<u8>, uid: Uid) -> Result<()> {
        if let Some(res) = self.results.lock().unwrap().get(&uid) {
            info!(snap_uid = %uid, "replaying finished snapshot result");
            return res.clone();
        }
        let joined = self.inflight.lock().unwrap().get(&uid).cloned();
        if let Some(mut rx) = joined {
            loop {
                if let Some(res) = rx.borrow().clone() {
                    return res;
                }
                rx.changed().await.map_err(|_| Error::OperationFailed)?;
            }
        }

        if !self.enabled.try_set_snapshot(uid) {
            // A previous request already disabled the distributor.
            warn!(snap_uid = %uid, "snapshot rejected, distributor already disabled");
            return Err(Error::OperationFailed);
        }
        let (tx, rx) = watch::channel(None);
        self.inflight.lock().unwrap().insert(uid, rx);

        info!(snap_uid = %uid, "snapshot starting");
        let result = match tokio::time::timeout(
            self.knobs.snap_create_max_timeout,
            self.snap_create_core(&payload, uid),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(Error::TimedOut),
        };

        if !self.enabled.try_set_enabled(uid) {
            warn!(snap_uid = %uid, "failed to re-enable distributor after snapshot");
        }
        self.inflight.lock().unwrap().remove(&uid);
        self.results.lock().unwrap().insert(uid, result.clone());
        let _ = tx.send(Some(result.clone()));

        let mgr = Arc::clone(self);
        let gap = self.knobs.snap_minimum_time_gap;
        tokio::spawn(async move {
            tokio::time::sleep(gap).await;
            mgr.results.lock().unwrap().remove(&uid);
        });

        match &result {
            Ok(()) => info!(snap_uid = %uid, "snapshot complete"),
            Err(err) => warn!(snap_uid = %uid, error = %err, "snapshot failed"),
        }
        result
    }

    async fn snap_create_core(&self, payload: &[u8], uid: Uid) -> Result<()> {
        self.store
            .run_txn(|tr| {
                tr.set(&keys::write_recovery_key(), b"1");
                Ok(())
            })
            .await?;

        let tlogs = self.read_tlogs().await?;
        let result = self.snap_workers(&tlogs, payload, uid).await;
        if let Err(err) = result {
            // Leave the cluster accepting writes again even on a failed
            // snapshot attempt.
            for tlog in &tlogs {
                let _ = self.transport.enable_tlog_pop(tlog.id, uid).await;
            }
            return Err(err);
        }

        self.store
            .run_txn(|tr| {
                tr.clear(&keys::write_recovery_key());
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn snap_workers(&self, tlogs: &[WorkerInfo], payload: &[u8], uid: Uid) -> Result<()> {
        let disables = tlogs
            .iter()
            .map(|t| self.transport.disable_tlog_pop(t.id, uid));
        for res in join_all(disables).await {
            res.map_err(|_| Error::SnapDisableTlogPopFailed)?;
        }

        // Storage before tlogs: a storage snapshot must not observe log
        // entries the tlog snapshot is missing.
        let (storage_addrs, team_size) = self
            .store
            .run_txn(|tr| {
                let servers = read_server_list(tr)?;
                let addrs: Vec<String> = servers
                    .iter()
                    .filter(|s| !s.is_tss)
                    .map(|s| s.addr.clone())
                    .collect();
                let team_size = tr
                    .get(&keys::config_key("storage_team_size"))
                    .and_then(|v| String::from_utf8(v).ok())
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(1);
                Ok((addrs, team_size))
            })
            .await?;
        let storage_tolerance = self
            .knobs
            .max_storage_snapshot_fault_tolerance
            .min(team_size.saturating_sub(1));
        let storage_snaps: Vec<_> = storage_addrs
            .iter()
            .map(|addr| {
                self.transport
                    .snapshot_worker(addr, WorkerRole::Storage, payload, uid)
            })
            .collect();
        wait_for_most(storage_snaps, storage_tolerance, Error::SnapStorageFailed).await?;

        let tlog_snaps: Vec<_> = tlogs
            .iter()
            .map(|t| {
                self.transport
                    .snapshot_worker(&t.addr, WorkerRole::TLog, payload, uid)
            })
            .collect();
        wait_for_most(tlog_snaps, 0, Error::SnapTlogFailed).await?;

        let enables = tlogs.iter().map(|t| self.transport.enable_tlog_pop(t.id, uid));
        for res in join_all(enables).await {
            res?;
        }

        let coordinators = self.read_coordinators().await?;
        let coord_tolerance = (coordinators.len().saturating_sub(1) / 2)
            .min(self.knobs.max_coordinator_snapshot_fault_tolerance);
        let coord_snaps: Vec<_> = coordinators
            .iter()
            .map(|addr| {
                self.transport
                    .snapshot_worker(addr, WorkerRole::Coordinator, payload, uid)
            })
            .collect();
        wait_for_most(coord_snaps, coord_tolerance, Error::SnapCoordFailed).await?;
        Ok(())
    }

    async fn read_tlogs(&self) -> Result<Vec<WorkerInfo>> {
        self.store
            .run_txn(|tr| {
                let prefix = keys::tlog_list_prefix();
                let end = keys::prefix_end(&prefix);
                let mut tlogs = Vec::new();
                for (_, value) in tr.get_range(&prefix, &end) {
                    tlogs.push(serde_json::from_slice::<WorkerInfo>(&value)?);
                }
                Ok(tlogs)
            })
            .await
    }

    async fn read_coordinators(&self) -> Result<Vec<String>> {
        self.store
            .run_txn(|tr| {
                Ok(match tr.get(&keys::coordinators_key()) {
                    Some(value) => serde_json::from_slice(&value)?,
                    None => Vec::new(),
                })
            })
            .await
    }
}

/// Resolve once at most `tolerance` of `futs` have failed; more failures
/// surface as `err`.
async fn wait_for_most(
    futs: Vec<impl std::future::Future<Output = Result<()>>>,
    tolerance: usize,
    err: Error,
) -> Result<()> {
    let results = join_all(futs).await;
    let failures = results.iter().filter(|r| r.is_err()).count();
    if failures > tolerance {
        Err(err)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_state_transitions_track_owner() {
        let state = DdEnabledState::new();
        assert!(state.is_enabled());

        let snap = Uid::new_v4();
        assert!(state.try_set_snapshot(snap));
        assert!(!state.is_enabled());
        // A second requester cannot disable or re-enable.
        assert!(!state.try_set_snapshot(Uid::new_v4()));
        assert!(!state.try_set_blob_restore_preparing(Uid::new_v4()));
        assert!(!state.try_set_enabled(Uid::new_v4()));
        // The owner can.
        assert!(state.try_set_enabled(snap));
        assert!(state.is_enabled());

        let restore = Uid::new_v4();
        assert!(state.try_set_blob_restore_preparing(restore));
        assert!(state.is_blob_restore_preparing());
        assert!(state.same_id(restore));
        assert!(state.try_set_enabled(restore));
    }
}
