//! Audit metadata and progress persistence.
//!
//! Audit rows live under `audits/(type, id)`. Progress rows live in exactly
//! one of two namespaces: per-server shard-map audits write server-based
//! progress, every other type writes range-based progress. Progress writes
//! validate the owning distributor and the audit phase, so tasks issued by a
//! dead distributor cannot corrupt a resumed audit's accounting.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::keys;
use crate::lock::{check_move_keys_lock, MoveKeysLock};
use crate::snapshot::DdEnabledState;
use crate::store::{rangemap_get, rangemap_set, SystemStore, Transaction};
use crate::{AuditType, KeyRange, Uid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditPhase {
    /// No progress recorded yet for a range.
    Invalid,
    Running,
    Complete,
    /// The audit found an inconsistency.
    Error,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditState {
    pub id: u64,
    pub audit_type: AuditType,
    pub range: KeyRange,
    pub phase: AuditPhase,
    /// The distributor that owns (or last owned) this audit.
    pub dd_id: Uid,
    pub error: Option<String>,
}

impl AuditState {
    pub fn new(audit_type: AuditType, range: KeyRange, dd_id: Uid) -> Self {
        Self {
            id: 0,
            audit_type,
            range,
            phase: AuditPhase::Running,
            dd_id,
            error: None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Progress rows for replica, HA and location-metadata audits are
/// range-based; per-server shard-map audits are server-based. This function
/// is the single place that enforces the namespace policy when clearing.
pub fn clear_audit_progress(tr: &mut Transaction<'_>, ty: AuditType, id: u64) {
    match ty {
        AuditType::ValidateStorageServerShard => {
            let prefix = keys::audit_server_progress_scan_prefix(ty, id);
            tr.clear_range(&prefix, &keys::prefix_end(&prefix));
        }
        AuditType::ValidateHa
        | AuditType::ValidateReplica
        | AuditType::ValidateLocationMetadata => {
            let prefix = keys::audit_range_progress_prefix(ty, id);
            tr.clear_range(&prefix, &keys::prefix_end(&prefix));
        }
    }
}

/// Allocate the next audit id for `state.audit_type` and persist the row.
/// Ids are collision-free because allocation happens under the move-keys
/// lock, with the largest existing id read in the same transaction. The
/// retry loop is hand-rolled: after a commit whose outcome is unknown, the
/// next attempt re-reads the newest id and, if it matches the one this call
/// already minted, returns it instead of allocating a second row.
pub async fn persist_new_audit_state(
    store: &SystemStore,
    lock: &MoveKeysLock,
    enabled: &DdEnabledState,
    state: &AuditState,
) -> Result<u64> {
    debug_assert_eq!(state.phase, AuditPhase::Running);
    let mut allocated: Option<u64> = None;
    let mut backoff = Duration::from_millis(5);
    loop {
        let mut tr = store.begin();
        let attempt: Result<Option<u64>> = (|| {
            check_move_keys_lock(&mut tr, lock, enabled, true)?;
            let prefix = keys::audit_type_prefix(state.audit_type);
            let rows = tr.get_range_limit(&prefix, &keys::prefix_end(&prefix), 1, true);
            let latest = match rows.first() {
                Some((_, value)) => Some(AuditState::decode(value)?),
                None => None,
            };
            if let (Some(prior), Some(latest)) = (allocated, latest.as_ref()) {
                if latest.id == prior {
                    // The earlier attempt landed after all. Nobody else can
                    // allocate under this lock, so the row is ours.
                    return Ok(Some(prior));
                }
                debug_assert!(
                    latest.id < prior,
                    "foreign audit id allocated under our lock"
                );
            }
            let next_id = latest.as_ref().map(|s| s.id + 1).unwrap_or(1);
            let mut row = state.clone();
            row.id = next_id;
            tr.set(&keys::audit_key(row.audit_type, next_id), &row.encode()?);
            allocated = Some(next_id);
            Ok(None)
        })();

        let committed = match attempt {
            Ok(Some(prior)) => {
                info!(
                    audit_type = ?state.audit_type,
                    audit_id = prior,
                    "recovered audit id from an earlier unresolved commit"
                );
                return Ok(prior);
            }
            Ok(None) => tr.commit().map(|_| ()),
            Err(err) => Err(err),
        };
        match committed {
            Ok(()) => {
                let id = allocated.expect("id allocated before commit");
                info!(audit_type = ?state.audit_type, audit_id = id, "persisted new audit");
                return Ok(id);
            }
            Err(err) if err.is_txn_retryable() => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(500));
            }
            Err(Error::MoveKeysConflict) => return Err(Error::PersistNewAuditMetadata),
            Err(err) => return Err(err),
        }
    }
}

/// Persist a final phase. Completing clears the progress records; `Error`
/// and `Failed` retain them for post-mortem. A row that disappeared or was
/// already failed means someone cancelled the audit underneath us.
pub async fn persist_audit_state(
    store: &SystemStore,
    lock: &MoveKeysLock,
    enabled: &DdEnabledState,
    state: &AuditState,
    context: &str,
) -> Result<()> {
    debug_assert!(matches!(
        state.phase,
        AuditPhase::Complete | AuditPhase::Error | AuditPhase::Failed
    ));
    store
        .run_txn(|tr| {
            check_move_keys_lock(tr, lock, enabled, true)?;
            if state.phase == AuditPhase::Complete {
                clear_audit_progress(tr, state.audit_type, state.id);
            }
            let existing = tr
                .get(&keys::audit_key(state.audit_type, state.id))
                .ok_or(Error::AuditStorageCancelled)?;
            let current = AuditState::decode(&existing)?;
            if current.phase == AuditPhase::Failed {
                return Err(Error::AuditStorageCancelled);
            }
            tr.set(&keys::audit_key(state.audit_type, state.id), &state.encode()?);
            Ok(())
        })
        .await?;
    debug!(
        audit_type = ?state.audit_type,
        audit_id = state.id,
        phase = ?state.phase,
        context,
        "persisted audit state"
    );
    Ok(())
}

pub async fn get_audit_state(
    store: &SystemStore,
    ty: AuditType,
    id: u64,
) -> Result<Option<AuditState>> {
    store
        .run_txn(|tr| match tr.get(&keys::audit_key(ty, id)) {
            Some(value) => Ok(Some(AuditState::decode(&value)?)),
            None => Ok(None),
        })
        .await
}

/// All audit rows of one type, ascending by id (or descending with
/// `newest_first`), optionally filtered by phase and bounded by `limit`.
pub async fn get_audit_states(
    store: &SystemStore,
    ty: AuditType,
    newest_first: bool,
    limit: Option<usize>,
    phase: Option<AuditPhase>,
) -> Result<Vec<AuditState>> {
    store
        .run_txn(|tr| {
            let prefix = keys::audit_type_prefix(ty);
            let rows = tr.get_range(&prefix, &keys::prefix_end(&prefix));
            let mut states = Vec::with_capacity(rows.len());
            for (_, value) in &rows {
                let state = AuditState::decode(value)?;
                if phase.is_some_and(|p| state.phase != p) {
                    continue;
                }
                states.push(state);
            }
            if newest_first {
                states.reverse();
            }
            if let Some(limit) = limit {
                states.truncate(limit);
            }
            Ok(states)
        })
        .await
}

fn validate_owning_audit(
    tr: &mut Transaction<'_>,
    ty: AuditType,
    id: u64,
    dd_id: Uid,
) -> Result<ProgressWriteDecision> {
    let row = tr
        .get(&keys::audit_key(ty, id))
        .ok_or(Error::AuditStorageCancelled)?;
    let owning = AuditState::decode(&row)?;
    if owning.dd_id != dd_id {
        // A new distributor took over; this task's results are stale.
        return Err(Error::AuditStorageFailed);
    }
    match owning.phase {
        // A task may race with completion; its progress no longer matters.
        AuditPhase::Complete => Ok(ProgressWriteDecision::Skip),
        AuditPhase::Failed => Err(Error::AuditStorageCancelled),
        _ => Ok(ProgressWriteDecision::Write),
    }
}

enum ProgressWriteDecision {
    Write,
    Skip,
}

/// Record per-range progress for a range-based audit.
pub async fn persist_audit_progress_by_range(
    store: &SystemStore,
    state: &AuditState,
) -> Result<()> {
    store
        .run_txn(|tr| {
            match validate_owning_audit(tr, state.audit_type, state.id, state.dd_id)? {
                ProgressWriteDecision::Skip => Ok(()),
                ProgressWriteDecision::Write => {
                    let prefix = keys::audit_range_progress_prefix(state.audit_type, state.id);
                    rangemap_set(tr, &prefix, &state.range, &state.encode()?);
                    Ok(())
                }
            }
        })
        .await
}

/// Record per-range progress under one server's namespace.
pub async fn persist_audit_progress_by_server(
    store: &SystemStore,
    state: &AuditState,
    server: Uid,
) -> Result<()> {
    store
        .run_txn(|tr| {
            match validate_owning_audit(tr, state.audit_type, state.id, state.dd_id)? {
                ProgressWriteDecision::Skip => Ok(()),
                ProgressWriteDecision::Write => {
                    let prefix =
                        keys::audit_server_progress_prefix(state.audit_type, state.id, server);
                    rangemap_set(tr, &prefix, &state.range, &state.encode()?);
                    Ok(())
                }
            }
        })
        .await
}

fn progress_entries(
    tr: &mut Transaction<'_>,
    prefix: &[u8],
    ty: AuditType,
    id: u64,
    range: &KeyRange,
) -> Result<Vec<AuditState>> {
    let mut states = Vec::new();
    for entry in rangemap_get(tr, prefix, range) {
        let mut state = if entry.value.is_empty() {
            AuditState {
                id,
                audit_type: ty,
                range: entry.range.clone(),
                phase: AuditPhase::Invalid,
                dd_id: Uid::nil(),
                error: None,
            }
        } else {
            AuditState::decode(&entry.value)?
        };
        state.range = entry.range;
        states.push(state);
    }
    Ok(states)
}

/// Aligned per-range progress over `range`; subranges with no record come
/// back in phase `Invalid`, which is what dispatch treats as "not yet
/// audited".
pub async fn get_audit_progress_by_range(
    store: &SystemStore,
    ty: AuditType,
    id: u64,
    range: &KeyRange,
) -> Result<Vec<AuditState>> {
    let range = range.clone();
    store
        .run_txn(move |tr| {
            let prefix = keys::audit_range_progress_prefix(ty, id);
            progress_entries(tr, &prefix, ty, id, &range)
        })
        .await
}

pub async fn get_audit_progress_by_server(
    store: &SystemStore,
    ty: AuditType,
    id: u64,
    server: Uid,
    range: &KeyRange,
) -> Result<Vec<AuditState>> {
    let range = range.clone();
    store
        .run_txn(move |tr| {
            let prefix = keys::audit_server_progress_prefix(ty, id, server);
            progress_entries(tr, &prefix, ty, id, &range)
        })
        .await
}

/// Whether the persisted progress covers `range` with no `Invalid` hole.
pub async fn check_audit_progress_complete(
    store: &SystemStore,
    ty: AuditType,
    id: u64,
    range: &KeyRange,
) -> Result<bool> {
    let states = get_audit_progress_by_range(store, ty, id, range).await?;
    for state in &states {
        if state.phase == AuditPhase::Invalid {
            warn!(
                audit_id = id,
                unfinished = ?state.range,
                "audit progress has an unfinished range"
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Cancel: flip the row to `Failed` and drop its progress records. Cancelling
/// an audit that is already gone is a no-op.
pub async fn cancel_audit_metadata(store: &SystemStore, ty: AuditType, id: u64) -> Result<()> {
    let result = store
        .run_txn(|tr| {
            let Some(row) = tr.get(&keys::audit_key(ty, id)) else {
                return Ok(());
            };
            let mut state = AuditState::decode(&row)?;
            debug_assert!(state.id == id && state.audit_type == ty);
            state.phase = AuditPhase::Failed;
            tr.set(&keys::audit_key(ty, id), &state.encode()?);
            clear_audit_progress(tr, ty, id);
            Ok(())
        })
        .await;
    result.map_err(|err| {
        warn!(audit_type = ?ty, audit_id = id, error = %err, "audit cancel failed");
        Error::CancelAuditStorageFailed
    })
}

/// Retention sweep for one audit type: keep the newest `keep` finished
/// audits at or below `max_id_to_clear`, delete the rest. Failed audits also
/// drop their progress records; complete audits already did at completion.
/// Sweep failures never propagate, cleanup must not disturb the distributor.
pub async fn clear_audit_metadata_for_type(
    store: &SystemStore,
    ty: AuditType,
    max_id_to_clear: u64,
    keep: usize,
) -> Result<()> {
    let swept = store
        .run_txn(|tr| {
            let prefix = keys::audit_type_prefix(ty);
            let rows = tr.get_range(&prefix, &keys::prefix_end(&prefix));
            let mut states = Vec::new();
            for (_, value) in &rows {
                states.push(AuditState::decode(value)?);
            }
            let finished: Vec<&AuditState> = states
                .iter()
                .filter(|s| s.id <= max_id_to_clear)
                .filter(|s| matches!(s.phase, AuditPhase::Complete | AuditPhase::Failed))
                .collect();
            let to_clean = finished.len().saturating_sub(keep);
            for state in finished.into_iter().take(to_clean) {
                tr.clear(&keys::audit_key(ty, state.id));
                if state.phase == AuditPhase::Failed {
                    clear_audit_progress(tr, ty, state.id);
                }
            }
            Ok(to_clean)
        })
        .await;
    match swept {
        Ok(cleaned) if cleaned > 0 => {
            debug!(audit_type = ?ty, cleaned, "cleared finished audit metadata");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(err) => {
            info!(audit_type = ?ty, error = %err, "audit metadata sweep failed");
            Ok(())
        }
    }
}

/// Bootstrap scan: claim every `Running` audit for this distributor and
/// prune finished rows beyond the retention count. Returns the audits to
/// resume, ordered by type then id.
pub async fn init_audit_metadata(
    store: &SystemStore,
    lock: &MoveKeysLock,
    enabled: &DdEnabledState,
    dd_id: Uid,
    keep: usize,
) -> Result<Vec<AuditState>> {
    store
        .run_txn(|tr| {
            check_move_keys_lock(tr, lock, enabled, true)?;
            let mut to_resume = Vec::new();
            for ty in AuditType::ALL {
                let prefix = keys::audit_type_prefix(ty);
                let rows = tr.get_range(&prefix, &keys::prefix_end(&prefix));
                let mut states = Vec::new();
                for (_, value) in &rows {
                    states.push(AuditState::decode(value)?);
                }
                states.sort_by_key(|s| s.id);

                let finished = states
                    .iter()
                    .filter(|s| matches!(s.phase, AuditPhase::Complete | AuditPhase::Failed))
                    .count();
                let mut to_clean = finished.saturating_sub(keep);
                for state in &states {
                    match state.phase {
                        AuditPhase::Running => {
                            let mut claimed = state.clone();
                            claimed.dd_id = dd_id;
                            tr.set(&keys::audit_key(ty, claimed.id), &claimed.encode()?);
                            to_resume.push(claimed);
                        }
                        AuditPhase::Complete if to_clean > 0 => {
                            tr.clear(&keys::audit_key(ty, state.id));
                            to_clean -= 1;
                        }
                        AuditPhase::Failed if to_clean > 0 => {
                            tr.clear(&keys::audit_key(ty, state.id));
                            clear_audit_progress(tr, ty, state.id);
                            to_clean -= 1;
                        }
                        _ => {}
                    }
                }
            }
            Ok(to_resume)
        })
        .await
}
