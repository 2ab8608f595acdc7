//! Tenant lifecycle: create, delete, configure, rename, lock.
//!
//! Tenants are indexed twice (id map plus name index) and optionally grouped;
//! the group map holds an entry iff at least one tenant references the group.
//! On a metacluster data cluster, deletion leaves a tombstone so a racing
//! replicated creation cannot reanimate a dead id; tombstones are garbage
//! collected behind a watermark on a timer.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::keys;
use crate::knobs::Knobs;
use crate::store::{SystemStore, Transaction};
use crate::{unix_time_ms, Uid};

pub const TENANT_ID_PREFIX_MIN: i64 = 0;
pub const TENANT_ID_PREFIX_MAX: i64 = 32767;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantMode {
    Disabled,
    Optional,
    Required,
}

impl TenantMode {
    fn from_config(value: Option<Vec<u8>>) -> Self {
        match value.as_deref() {
            Some(b"1") | Some(b"optional_experimental") => TenantMode::Optional,
            Some(b"2") | Some(b"required_experimental") => TenantMode::Required,
            _ => TenantMode::Disabled,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterType {
    Standalone,
    MetaclusterManagement,
    MetaclusterData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantLockState {
    Unlocked,
    ReadOnly,
    Locked,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMapEntry {
    pub id: i64,
    pub name: Vec<u8>,
    pub tenant_group: Option<Vec<u8>>,
    pub lock_state: TenantLockState,
    pub lock_id: Option<Uid>,
    pub configuration_sequence_num: i64,
}

impl TenantMapEntry {
    pub fn new(id: i64, name: Vec<u8>) -> Self {
        Self {
            id,
            name,
            tenant_group: None,
            lock_state: TenantLockState::Unlocked,
            lock_id: None,
            configuration_sequence_num: 0,
        }
    }

    /// The byte prefix owning this tenant's data: `\x02` plus the big-endian
    /// id.
    pub fn prefix(&self) -> Vec<u8> {
        let mut p = vec![0x02];
        p.extend_from_slice(&(self.id as u64).to_be_bytes());
        p
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantGroupEntry {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TombstoneCleanupData {
    /// Ids at or below this are permanently unknowable; creating them fails.
    pub tombstones_erased_through: i64,
    /// The next cleanup erases tombstones through this id.
    pub next_tombstone_erase_id: i64,
    /// Unix ms when the next cleanup may run.
    pub next_tombstone_erase_at_ms: u64,
}

pub fn tenant_id_prefix_of(id: i64) -> i64 {
    id >> 48
}

fn compute_next_tenant_id(last: i64, delta: i64) -> Result<i64> {
    let next = last + delta;
    if tenant_id_prefix_of(next) != tenant_id_prefix_of(last) {
        // The 48-bit counter space under this cluster's prefix is spent.
        return Err(Error::ClusterNoCapacity);
    }
    Ok(next)
}

pub fn get_cluster_type(tr: &mut Transaction<'_>) -> ClusterType {
    match tr.get(&keys::metacluster_registration_key()).as_deref() {
        Some(b"management") => ClusterType::MetaclusterManagement,
        Some(b"data") => ClusterType::MetaclusterData,
        _ => ClusterType::Standalone,
    }
}

pub fn tenant_mode(tr: &mut Transaction<'_>) -> TenantMode {
    TenantMode::from_config(tr.get(&keys::config_key("tenant_mode")))
}

/// Every tenant mutation verifies it runs on the cluster type it was meant
/// for, and that tenants are enabled on standalone clusters.
pub fn check_tenant_mode(tr: &mut Transaction<'_>, expected: ClusterType) -> Result<()> {
    let actual = get_cluster_type(tr);
    if actual != expected {
        return Err(Error::InvalidMetaclusterOperation);
    }
    if actual == ClusterType::Standalone && tenant_mode(tr) == TenantMode::Disabled {
        return Err(Error::TenantsDisabled);
    }
    Ok(())
}

pub fn try_get_tenant_by_id(tr: &mut Transaction<'_>, id: i64) -> Result<Option<TenantMapEntry>> {
    match tr.get(&keys::tenant_map_key(id)) {
        Some(value) => Ok(Some(TenantMapEntry::decode(&value)?)),
        None => Ok(None),
    }
}

pub fn try_get_tenant_by_name(
    tr: &mut Transaction<'_>,
    name: &[u8],
) -> Result<Option<TenantMapEntry>> {
    match tr.get(&keys::tenant_name_index_key(name)) {
        Some(id_bytes) => {
            let id = keys::decode_i64(&id_bytes)
                .ok_or_else(|| Error::Internal("corrupt tenant name index".into()))?;
            try_get_tenant_by_id(tr, id)
        }
        None => Ok(None),
    }
}

fn tenant_count(tr: &mut Transaction<'_>) -> i64 {
    tr.get(&keys::tenant_count_key())
        .and_then(|v| keys::decode_i64(&v))
        .unwrap_or(0)
}

fn set_tenant_count(tr: &mut Transaction<'_>, count: i64) {
    tr.set(&keys::tenant_count_key(), &keys::encode_i64(count));
}

/// Monotonic stamp bumped by every tenant mutation.
fn stamp_last_modification(tr: &mut Transaction<'_>) {
    let next = tr
        .get(&keys::tenant_last_modification_key())
        .and_then(|v| keys::decode_u64(&v))
        .unwrap_or(0)
        + 1;
    tr.set(&keys::tenant_last_modification_key(), &keys::encode_u64(next));
}

/// True if `id` is tombstoned. Ids already behind the cleanup watermark can
/// never be created again.
fn check_tombstone(tr: &mut Transaction<'_>, id: i64) -> Result<bool> {
    if let Some(data) = read_cleanup_data(tr)? {
        if data.tombstones_erased_through >= id {
            return Err(Error::TenantCreationPermanentlyFailed);
        }
    }
    Ok(tr.get(&keys::tenant_tombstone_key(id)).is_some())
}

fn read_cleanup_data(tr: &mut Transaction<'_>) -> Result<Option<TombstoneCleanupData>> {
    match tr.get(&keys::tenant_tombstone_cleanup_key()) {
        Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
        None => Ok(None),
    }
}

/// True when the group index holds a tenant of `group` other than
/// `excluding_id`.
fn group_has_other_tenants(
    tr: &mut Transaction<'_>,
    group: &[u8],
    excluding_id: i64,
) -> Result<bool> {
    let prefix = keys::tenant_group_index_scan_prefix(group);
    let entries = tr.get_range_limit(&prefix, &keys::prefix_end(&prefix), 2, false);
    for (key, _) in entries {
        let id_bytes = &key[key.len() - 8..];
        let id = keys::decode_i64(id_bytes)
            .ok_or_else(|| Error::Internal("corrupt tenant group index".into()))?;
        if id != excluding_id {
            return Ok(true);
        }
    }
    Ok(false)
}

enum CreateOutcome {
    Created(TenantMapEntry),
    AlreadyExists,
    BlockedByTombstone,
}

fn create_tenant_transaction(
    tr: &mut Transaction<'_>,
    entry: &TenantMapEntry,
    cluster_type: ClusterType,
    max_tenants: i64,
) -> Result<CreateOutcome> {
    debug_assert!(cluster_type != ClusterType::MetaclusterManagement);
    debug_assert!(entry.id >= 0);

    if entry.name.starts_with(&[0xff]) {
        return Err(Error::InvalidTenantName);
    }
    if let Some(group) = &entry.tenant_group {
        if group.starts_with(&[0xff]) {
            return Err(Error::InvalidTenantGroupName);
        }
    }
    check_tenant_mode(tr, cluster_type)?;

    if try_get_tenant_by_name(tr, &entry.name)?.is_some() {
        return Ok(CreateOutcome::AlreadyExists);
    }
    if cluster_type == ClusterType::MetaclusterData && check_tombstone(tr, entry.id)? {
        return Ok(CreateOutcome::BlockedByTombstone);
    }

    let prefix = entry.prefix();
    let contents = tr.get_range_limit(&prefix, &keys::prefix_end(&prefix), 1, false);
    if !contents.is_empty() {
        return Err(Error::TenantPrefixAllocatorConflict);
    }

    tr.set(&keys::tenant_map_key(entry.id), &entry.encode()?);
    tr.set(
        &keys::tenant_name_index_key(&entry.name),
        &keys::encode_i64(entry.id),
    );
    stamp_last_modification(tr);

    if let Some(group) = &entry.tenant_group {
        tr.set(
            &keys::tenant_group_index_key(group, &entry.name, entry.id),
            b"",
        );
        if tr.get(&keys::tenant_group_map_key(group)).is_none() {
            tr.set(
                &keys::tenant_group_map_key(group),
                &serde_json::to_vec(&TenantGroupEntry::default())?,
            );
        }
    }

    let count = tenant_count(tr) + 1;
    set_tenant_count(tr, count);
    if count > max_tenants {
        return Err(Error::ClusterNoCapacity);
    }

    Ok(CreateOutcome::Created(entry.clone()))
}

fn next_tenant_id(tr: &mut Transaction<'_>, knobs: &Knobs) -> Result<i64> {
    let last = match tr
        .get(&keys::tenant_last_id_key())
        .and_then(|v| keys::decode_i64(&v))
    {
        Some(last) => last,
        None => {
            let prefix = tr
                .get(&keys::tenant_id_prefix_key())
                .and_then(|v| keys::decode_i64(&v))
                .unwrap_or(0);
            debug_assert!((TENANT_ID_PREFIX_MIN..=TENANT_ID_PREFIX_MAX).contains(&prefix));
            prefix << 48
        }
    };
    let mut delta = 1;
    if knobs.tenant_id_random_skew {
        delta += rand::thread_rng().gen_range(0..1_000_000);
    }
    let next = compute_next_tenant_id(last, delta)?;
    tr.set(&keys::tenant_last_id_key(), &keys::encode_i64(next));
    Ok(next)
}

/// Create a tenant. On a standalone cluster the id is allocated here; on a
/// data cluster the management cluster supplies it.
pub async fn create_tenant(
    store: &SystemStore,
    knobs: &Knobs,
    name: Vec<u8>,
    tenant_group: Option<Vec<u8>>,
    cluster_type: ClusterType,
    explicit_id: Option<i64>,
) -> Result<TenantMapEntry> {
    if cluster_type == ClusterType::MetaclusterManagement {
        return Err(Error::InvalidMetaclusterOperation);
    }
    if cluster_type != ClusterType::Standalone && explicit_id.is_none() {
        return Err(Error::InvalidMetaclusterOperation);
    }

    let created = store
        .run_txn(|tr| {
            let id = match explicit_id {
                Some(id) => id,
                None => next_tenant_id(tr, knobs)?,
            };
            let mut entry = TenantMapEntry::new(id, name.clone());
            entry.tenant_group = tenant_group.clone();
            match create_tenant_transaction(tr, &entry, cluster_type, knobs.max_tenants_per_cluster)?
            {
                CreateOutcome::Created(entry) => Ok(entry),
                CreateOutcome::AlreadyExists => Err(Error::TenantAlreadyExists),
                CreateOutcome::BlockedByTombstone => Err(Error::TenantCreationBlocked),
            }
        })
        .await?;
    info!(
        tenant = ?String::from_utf8_lossy(&created.name),
        tenant_id = created.id,
        group = ?created.tenant_group.as_ref().map(|g| String::from_utf8_lossy(g).into_owned()),
        "created tenant"
    );
    Ok(created)
}

/// On data clusters, record a tombstone for a dead id and periodically
/// advance the cleanup watermark.
fn mark_tenant_tombstones(
    tr: &mut Transaction<'_>,
    tenant_id: i64,
    cleanup_interval_ms: u64,
    now_ms: u64,
) -> Result<()> {
    let cluster_prefix = tr
        .get(&keys::tenant_id_prefix_key())
        .and_then(|v| keys::decode_i64(&v))
        .unwrap_or(0);
    // An id from a foreign prefix cannot collide with local creations.
    if cluster_prefix != tenant_id_prefix_of(tenant_id) {
        return Ok(());
    }

    let cleanup = read_cleanup_data(tr)?;
    match &cleanup {
        Some(data) if data.next_tombstone_erase_at_ms > now_ms => {
            if tenant_id > data.tombstones_erased_through {
                tr.set(&keys::tenant_tombstone_key(tenant_id), b"");
            }
        }
        _ => {
            // Time to clean: erase everything through the previously marked
            // id, then advance the watermark through the newest known id.
            let delete_through = cleanup
                .as_ref()
                .map(|d| d.next_tombstone_erase_id)
                .unwrap_or(-1);
            if delete_through >= 0 {
                tr.clear_range(
                    &keys::tenant_tombstone_key(0),
                    &keys::tenant_tombstone_key(delete_through + 1),
                );
            }
            let latest = {
                let prefix = keys::tenant_tombstone_prefix();
                tr.get_range_limit(&prefix, &keys::prefix_end(&prefix), 1, true)
                    .first()
                    .and_then(|(key, _)| keys::decode_tenant_tombstone_id(key))
            };
            let mut next_delete_through = delete_through.max(tenant_id);
            if let Some(latest) = latest {
                next_delete_through = next_delete_through.max(latest);
            }
            let updated = TombstoneCleanupData {
                tombstones_erased_through: delete_through,
                next_tombstone_erase_id: next_delete_through,
                next_tombstone_erase_at_ms: now_ms + cleanup_interval_ms,
            };
            tr.set(
                &keys::tenant_tombstone_cleanup_key(),
                &serde_json::to_vec(&updated)?,
            );
            if tenant_id > updated.tombstones_erased_through {
                tr.set(&keys::tenant_tombstone_key(tenant_id), b"");
            }
        }
    }
    Ok(())
}

/// Delete by id; absent ids are a no-op so retried deletions stay
/// idempotent.
fn delete_tenant_transaction(
    tr: &mut Transaction<'_>,
    tenant_id: i64,
    cluster_type: ClusterType,
    knobs: &Knobs,
) -> Result<()> {
    debug_assert!(cluster_type != ClusterType::MetaclusterManagement);
    check_tenant_mode(tr, cluster_type)?;

    if let Some(entry) = try_get_tenant_by_id(tr, tenant_id)? {
        let prefix = entry.prefix();
        let contents = tr.get_range_limit(&prefix, &keys::prefix_end(&prefix), 1, false);
        if !contents.is_empty() {
            return Err(Error::TenantNotEmpty);
        }

        tr.clear(&keys::tenant_map_key(tenant_id));
        tr.clear(&keys::tenant_name_index_key(&entry.name));
        let new_tenant_count = tenant_count(tr) - 1;
        set_tenant_count(tr, new_tenant_count);
        stamp_last_modification(tr);

        if let Some(group) = &entry.tenant_group {
            tr.clear(&keys::tenant_group_index_key(group, &entry.name, tenant_id));
            if !group_has_other_tenants(tr, group, tenant_id)? {
                tr.clear(&keys::tenant_group_map_key(group));
            }
        }
    }

    if cluster_type == ClusterType::MetaclusterData {
        mark_tenant_tombstones(
            tr,
            tenant_id,
            knobs.tenant_tombstone_cleanup_interval.as_millis() as u64,
            unix_time_ms(),
        )?;
    }
    Ok(())
}

pub async fn delete_tenant(
    store: &SystemStore,
    knobs: &Knobs,
    name: Vec<u8>,
    expected_id: Option<i64>,
    cluster_type: ClusterType,
) -> Result<()> {
    store
        .run_txn(|tr| {
            let actual = tr
                .get(&keys::tenant_name_index_key(&name))
                .and_then(|v| keys::decode_i64(&v));
            let Some(id) = actual else {
                return Err(Error::TenantNotFound);
            };
            if expected_id.is_some_and(|expected| expected != id) {
                return Err(Error::TenantNotFound);
            }
            delete_tenant_transaction(tr, id, cluster_type, knobs)
        })
        .await?;
    info!(tenant = ?String::from_utf8_lossy(&name), "deleted tenant");
    Ok(())
}

/// Replace a tenant entry, keeping the group map consistent with the group
/// index and the lock owner consistent with the lock state.
pub fn configure_tenant_transaction(
    tr: &mut Transaction<'_>,
    original: &TenantMapEntry,
    updated: &TenantMapEntry,
) -> Result<()> {
    debug_assert_eq!(original.id, updated.id);
    if updated.lock_id.is_some() != (updated.lock_state != TenantLockState::Unlocked) {
        return Err(Error::Internal(
            "tenant lock owner must be present iff locked".into(),
        ));
    }

    tr.set(&keys::tenant_map_key(updated.id), &updated.encode()?);
    stamp_last_modification(tr);

    if original.tenant_group != updated.tenant_group {
        if let Some(group) = &updated.tenant_group {
            if group.starts_with(&[0xff]) {
                return Err(Error::InvalidTenantGroupName);
            }
        }
        if let Some(old_group) = &original.tenant_group {
            tr.clear(&keys::tenant_group_index_key(
                old_group,
                &original.name,
                original.id,
            ));
            if !group_has_other_tenants(tr, old_group, original.id)? {
                tr.clear(&keys::tenant_group_map_key(old_group));
            }
        }
        if let Some(new_group) = &updated.tenant_group {
            if tr.get(&keys::tenant_group_map_key(new_group)).is_none() {
                tr.set(
                    &keys::tenant_group_map_key(new_group),
                    &serde_json::to_vec(&TenantGroupEntry::default())?,
                );
            }
            tr.set(
                &keys::tenant_group_index_key(new_group, &updated.name, updated.id),
                b"",
            );
        }
    }
    Ok(())
}

pub async fn configure_tenant(
    store: &SystemStore,
    name: Vec<u8>,
    cluster_type: ClusterType,
    mutate: impl Fn(&mut TenantMapEntry),
) -> Result<TenantMapEntry> {
    store
        .run_txn(|tr| {
            check_tenant_mode(tr, cluster_type)?;
            let original = try_get_tenant_by_name(tr, &name)?.ok_or(Error::TenantNotFound)?;
            let mut updated = original.clone();
            mutate(&mut updated);
            updated.id = original.id;
            updated.name = original.name.clone();
            updated.configuration_sequence_num = original.configuration_sequence_num + 1;
            configure_tenant_transaction(tr, &original, &updated)?;
            Ok(updated)
        })
        .await
}

/// Transaction body of a rename; data clusters pass the management
/// cluster's configuration sequence number so a stale retry is dropped.
pub fn rename_tenant_transaction(
    tr: &mut Transaction<'_>,
    old_name: &[u8],
    new_name: &[u8],
    tenant_id: i64,
    cluster_type: ClusterType,
    configure_sequence_num: Option<i64>,
    knobs: &Knobs,
) -> Result<()> {
    debug_assert!(cluster_type != ClusterType::MetaclusterManagement);
    check_tenant_mode(tr, cluster_type)?;

    let mut entry = try_get_tenant_by_id(tr, tenant_id)?.ok_or(Error::TenantNotFound)?;
    if entry.name != old_name {
        return Err(Error::TenantNotFound);
    }
    if try_get_tenant_by_name(tr, new_name)?.is_some() {
        return Err(Error::TenantAlreadyExists);
    }

    if let Some(seq) = configure_sequence_num {
        if entry.configuration_sequence_num > seq {
            // A newer configuration already applied this rename.
            return Ok(());
        }
        entry.configuration_sequence_num = seq;
    }
    entry.name = new_name.to_vec();

    tr.set(&keys::tenant_map_key(tenant_id), &entry.encode()?);
    tr.set(
        &keys::tenant_name_index_key(new_name),
        &keys::encode_i64(tenant_id),
    );
    tr.clear(&keys::tenant_name_index_key(old_name));

    if let Some(group) = &entry.tenant_group {
        tr.clear(&keys::tenant_group_index_key(group, old_name, tenant_id));
        tr.set(&keys::tenant_group_index_key(group, new_name, tenant_id), b"");
    }
    stamp_last_modification(tr);

    if cluster_type == ClusterType::MetaclusterData {
        mark_tenant_tombstones(
            tr,
            tenant_id,
            knobs.tenant_tombstone_cleanup_interval.as_millis() as u64,
            unix_time_ms(),
        )?;
    }
    Ok(())
}

/// Rename, idempotent across commit-unknown retries: a retry that finds the
/// entry already carrying the new name succeeds silently.
pub async fn rename_tenant(
    store: &SystemStore,
    knobs: &Knobs,
    old_name: Vec<u8>,
    new_name: Vec<u8>,
    tenant_id: Option<i64>,
    cluster_type: ClusterType,
) -> Result<()> {
    if cluster_type != ClusterType::Standalone && tenant_id.is_none() {
        return Err(Error::InvalidMetaclusterOperation);
    }
    let mut first_try = true;
    store
        .run_txn(|tr| {
            let id = match tenant_id {
                Some(id) => id,
                None => tr
                    .get(&keys::tenant_name_index_key(&old_name))
                    .and_then(|v| keys::decode_i64(&v))
                    .ok_or(Error::TenantNotFound)?,
            };
            let entry = try_get_tenant_by_id(tr, id)?.ok_or(Error::TenantNotFound)?;
            let new_name_id = tr
                .get(&keys::tenant_name_index_key(&new_name))
                .and_then(|v| keys::decode_i64(&v));

            if !first_try && entry.name == new_name {
                return Ok(());
            }
            if entry.name != old_name {
                return Err(Error::TenantNotFound);
            }
            if new_name_id.is_some_and(|other| other != id) {
                return Err(Error::TenantAlreadyExists);
            }
            first_try = false;

            rename_tenant_transaction(tr, &old_name, &new_name, id, cluster_type, None, knobs)
        })
        .await?;
    info!(
        from = ?String::from_utf8_lossy(&old_name),
        to = ?String::from_utf8_lossy(&new_name),
        "renamed tenant"
    );
    Ok(())
}

/// Lock-state transition. A no-op when the requested pair is already in
/// place; a different owner's lock refuses the change.
pub async fn change_lock_state(
    store: &SystemStore,
    name: Vec<u8>,
    desired: TenantLockState,
    lock_id: Uid,
) -> Result<()> {
    store
        .run_txn(|tr| {
            check_tenant_mode(tr, ClusterType::Standalone)?;
            let entry = try_get_tenant_by_name(tr, &name)?.ok_or(Error::TenantNotFound)?;

            if entry.lock_id == Some(lock_id) && entry.lock_state == desired {
                return Ok(());
            }
            if entry.lock_id.is_some() && entry.lock_id != Some(lock_id) {
                return Err(Error::TenantLocked);
            }

            let mut updated = entry.clone();
            updated.lock_state = desired;
            updated.lock_id = if desired == TenantLockState::Unlocked {
                None
            } else {
                Some(lock_id)
            };
            configure_tenant_transaction(tr, &entry, &updated)
        })
        .await
}

pub async fn list_tenants(
    store: &SystemStore,
    begin: Vec<u8>,
    end: Vec<u8>,
    limit: usize,
) -> Result<Vec<(Vec<u8>, i64)>> {
    store
        .run_txn(|tr| {
            let prefix = keys::tenant_name_index_prefix();
            let mut from = prefix.clone();
            from.extend_from_slice(&begin);
            let mut to = prefix.clone();
            if end.is_empty() {
                to = keys::prefix_end(&prefix);
            } else {
                to.extend_from_slice(&end);
            }
            let mut out = Vec::new();
            for (key, value) in tr.get_range_limit(&from, &to, limit, false) {
                let name = key[prefix.len()..].to_vec();
                let id = keys::decode_i64(&value)
                    .ok_or_else(|| Error::Internal("corrupt tenant name index".into()))?;
                out.push((name, id));
            }
            Ok(out)
        })
        .await
}

pub async fn list_tenant_groups(
    store: &SystemStore,
    limit: usize,
) -> Result<Vec<(Vec<u8>, TenantGroupEntry)>> {
    store
        .run_txn(|tr| {
            let prefix = keys::tenant_group_map_prefix();
            let mut out = Vec::new();
            for (key, value) in
                tr.get_range_limit(&prefix, &keys::prefix_end(&prefix), limit, false)
            {
                out.push((key[prefix.len()..].to_vec(), serde_json::from_slice(&value)?));
            }
            Ok(out)
        })
        .await
}

/// Tenants of one group, in name order.
pub async fn list_tenant_group_tenants(
    store: &SystemStore,
    group: Vec<u8>,
    limit: usize,
) -> Result<Vec<(Vec<u8>, i64)>> {
    store
        .run_txn(|tr| {
            let prefix = keys::tenant_group_index_scan_prefix(&group);
            let mut out = Vec::new();
            for (key, _) in tr.get_range_limit(&prefix, &keys::prefix_end(&prefix), limit, false) {
                let tail = &key[prefix.len()..];
                if tail.len() < 12 {
                    return Err(Error::Internal("corrupt tenant group index".into()));
                }
                let name_len = u32::from_be_bytes(tail[..4].try_into().unwrap()) as usize;
                let name = tail[4..4 + name_len].to_vec();
                let id = keys::decode_i64(&tail[4 + name_len..])
                    .ok_or_else(|| Error::Internal("corrupt tenant group index".into()))?;
                out.push((name, id));
            }
            Ok(out)
        })
        .await
}

/// Tenants whose recorded storage usage exceeds their quota.
pub async fn tenants_over_storage_quota(store: &SystemStore) -> Result<Vec<i64>> {
    store
        .run_txn(|tr| {
            let prefix = keys::tenant_quota_prefix();
            let quotas = tr.get_range(&prefix, &keys::prefix_end(&prefix));
            let mut over = Vec::new();
            for (key, value) in quotas {
                let id_bytes = &key[prefix.len()..];
                let Some(id) = keys::decode_i64(id_bytes) else {
                    continue;
                };
                let Some(quota) = keys::decode_i64(&value) else {
                    continue;
                };
                let usage = tr
                    .get(&keys::tenant_usage_key(id))
                    .and_then(|v| keys::decode_i64(&v))
                    .unwrap_or(0);
                if usage > quota {
                    over.push(id);
                }
            }
            Ok(over)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SystemStore;

    async fn tenant_store() -> (tempfile::TempDir, SystemStore, Knobs) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SystemStore::open(dir.path().join("sys")).expect("open store");
        let mut tr = store.begin();
        tr.set(&keys::config_key("tenant_mode"), b"2");
        tr.commit().expect("enable tenants");
        (dir, store, Knobs::default())
    }

    #[tokio::test]
    async fn create_allocates_prefixed_sequential_ids() {
        let (_dir, store, knobs) = tenant_store().await;
        let mut tr = store.begin();
        tr.set(&keys::tenant_id_prefix_key(), &keys::encode_i64(7));
        tr.commit().expect("set prefix");

        let a = create_tenant(&store, &knobs, b"alpha".to_vec(), None, ClusterType::Standalone, None)
            .await
            .expect("create alpha");
        let b = create_tenant(&store, &knobs, b"beta".to_vec(), None, ClusterType::Standalone, None)
            .await
            .expect("create beta");
        assert_eq!(tenant_id_prefix_of(a.id), 7);
        assert_eq!(b.id, a.id + 1);
        assert_eq!(a.prefix()[0], 0x02);
    }

    #[tokio::test]
    async fn duplicate_names_and_ff_names_are_rejected() {
        let (_dir, store, knobs) = tenant_store().await;
        create_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::Standalone, None)
            .await
            .expect("create");
        let dup =
            create_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::Standalone, None).await;
        assert_eq!(dup, Err(Error::TenantAlreadyExists));

        let bad = create_tenant(
            &store,
            &knobs,
            b"\xffsys".to_vec(),
            None,
            ClusterType::Standalone,
            None,
        )
        .await;
        assert_eq!(bad, Err(Error::InvalidTenantName));

        // The empty name is allowed.
        create_tenant(&store, &knobs, Vec::new(), None, ClusterType::Standalone, None)
            .await
            .expect("empty name");
    }

    #[tokio::test]
    async fn tenants_disabled_blocks_operations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SystemStore::open(dir.path().join("sys")).expect("open store");
        let knobs = Knobs::default();
        let res =
            create_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::Standalone, None).await;
        assert_eq!(res, Err(Error::TenantsDisabled));
    }

    #[tokio::test]
    async fn delete_requires_empty_prefix() {
        let (_dir, store, knobs) = tenant_store().await;
        let entry =
            create_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::Standalone, None)
                .await
                .expect("create");

        let mut tr = store.begin();
        let mut data_key = entry.prefix();
        data_key.extend_from_slice(b"row");
        tr.set(&data_key, b"value");
        tr.commit().expect("write tenant data");

        let res = delete_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::Standalone).await;
        assert_eq!(res, Err(Error::TenantNotEmpty));

        let mut tr = store.begin();
        tr.clear(&data_key);
        tr.commit().expect("clear tenant data");
        delete_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::Standalone)
            .await
            .expect("delete");

        let res = delete_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::Standalone).await;
        assert_eq!(res, Err(Error::TenantNotFound));
    }

    #[tokio::test]
    async fn group_entry_exists_iff_group_nonempty() {
        let (_dir, store, knobs) = tenant_store().await;
        create_tenant(
            &store,
            &knobs,
            b"a".to_vec(),
            Some(b"g".to_vec()),
            ClusterType::Standalone,
            None,
        )
        .await
        .expect("create a");
        create_tenant(
            &store,
            &knobs,
            b"b".to_vec(),
            Some(b"g".to_vec()),
            ClusterType::Standalone,
            None,
        )
        .await
        .expect("create b");

        let groups = list_tenant_groups(&store, 10).await.expect("groups");
        assert_eq!(groups.len(), 1);
        let members = list_tenant_group_tenants(&store, b"g".to_vec(), 10)
            .await
            .expect("members");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].0, b"a".to_vec());

        delete_tenant(&store, &knobs, b"a".to_vec(), None, ClusterType::Standalone)
            .await
            .expect("delete a");
        assert_eq!(list_tenant_groups(&store, 10).await.expect("groups").len(), 1);

        delete_tenant(&store, &knobs, b"b".to_vec(), None, ClusterType::Standalone)
            .await
            .expect("delete b");
        assert!(list_tenant_groups(&store, 10).await.expect("groups").is_empty());
    }

    #[tokio::test]
    async fn rename_round_trip_restores_the_entry() {
        let (_dir, store, knobs) = tenant_store().await;
        let before = create_tenant(
            &store,
            &knobs,
            b"a".to_vec(),
            Some(b"g".to_vec()),
            ClusterType::Standalone,
            None,
        )
        .await
        .expect("create");

        rename_tenant(&store, &knobs, b"a".to_vec(), b"b".to_vec(), None, ClusterType::Standalone)
            .await
            .expect("rename a->b");
        rename_tenant(&store, &knobs, b"b".to_vec(), b"a".to_vec(), None, ClusterType::Standalone)
            .await
            .expect("rename b->a");

        let after = store
            .run_txn(|tr| try_get_tenant_by_name(tr, b"a"))
            .await
            .expect("read")
            .expect("present");
        assert_eq!(after, before);

        // Renaming to an occupied name fails.
        create_tenant(&store, &knobs, b"c".to_vec(), None, ClusterType::Standalone, None)
            .await
            .expect("create c");
        let res = rename_tenant(
            &store,
            &knobs,
            b"a".to_vec(),
            b"c".to_vec(),
            None,
            ClusterType::Standalone,
        )
        .await;
        assert_eq!(res, Err(Error::TenantAlreadyExists));
    }

    #[tokio::test]
    async fn lock_state_tracks_owner() {
        let (_dir, store, knobs) = tenant_store().await;
        create_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::Standalone, None)
            .await
            .expect("create");

        let owner = Uid::new_v4();
        change_lock_state(&store, b"t".to_vec(), TenantLockState::Locked, owner)
            .await
            .expect("lock");
        let entry = store
            .run_txn(|tr| try_get_tenant_by_name(tr, b"t"))
            .await
            .expect("read")
            .expect("present");
        assert_eq!(entry.lock_state, TenantLockState::Locked);
        assert_eq!(entry.lock_id, Some(owner));

        // Someone else cannot touch the lock.
        let other = Uid::new_v4();
        let res = change_lock_state(&store, b"t".to_vec(), TenantLockState::Unlocked, other).await;
        assert_eq!(res, Err(Error::TenantLocked));

        // The owner's identical request is a no-op; unlock clears the owner.
        change_lock_state(&store, b"t".to_vec(), TenantLockState::Locked, owner)
            .await
            .expect("idempotent lock");
        change_lock_state(&store, b"t".to_vec(), TenantLockState::Unlocked, owner)
            .await
            .expect("unlock");
        let entry = store
            .run_txn(|tr| try_get_tenant_by_name(tr, b"t"))
            .await
            .expect("read")
            .expect("present");
        assert_eq!(entry.lock_state, TenantLockState::Unlocked);
        assert_eq!(entry.lock_id, None);
    }

    #[tokio::test]
    async fn capacity_cap_rejects_the_overflowing_tenant() {
        let (_dir, store, mut knobs) = tenant_store().await;
        knobs.max_tenants_per_cluster = 1;
        create_tenant(&store, &knobs, b"a".to_vec(), None, ClusterType::Standalone, None)
            .await
            .expect("first fits");
        let res =
            create_tenant(&store, &knobs, b"b".to_vec(), None, ClusterType::Standalone, None).await;
        assert_eq!(res, Err(Error::ClusterNoCapacity));

        // The failed creation rolled back entirely.
        let names = list_tenants(&store, Vec::new(), Vec::new(), 10)
            .await
            .expect("list");
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn data_cluster_delete_blocks_recreation_within_tombstone_window() {
        let (_dir, store, knobs) = tenant_store().await;
        let mut tr = store.begin();
        tr.set(&keys::metacluster_registration_key(), b"data");
        tr.commit().expect("register data cluster");

        let id = 42;
        create_tenant(
            &store,
            &knobs,
            b"t".to_vec(),
            None,
            ClusterType::MetaclusterData,
            Some(id),
        )
        .await
        .expect("create");
        delete_tenant(&store, &knobs, b"t".to_vec(), None, ClusterType::MetaclusterData)
            .await
            .expect("delete");

        let res = create_tenant(
            &store,
            &knobs,
            b"t".to_vec(),
            None,
            ClusterType::MetaclusterData,
            Some(id),
        )
        .await;
        assert_eq!(res, Err(Error::TenantCreationBlocked));

        // A fresh id is fine.
        create_tenant(
            &store,
            &knobs,
            b"t".to_vec(),
            None,
            ClusterType::MetaclusterData,
            Some(id + 1),
        )
        .await
        .expect("fresh id");
    }
}
