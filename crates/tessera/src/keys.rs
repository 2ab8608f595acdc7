//! Layout of the persisted system keyspace.
//!
//! Every key the distributor reads or writes lives under the `\xff/` system
//! prefix. Values are serde_json documents unless noted (single bytes and
//! big-endian integers for counters).

use crate::{AuditType, Uid};

/// End of the user keyspace. Shard and audit ranges never extend past this.
pub const USER_KEYSPACE_END: &[u8] = b"\xff";

/// One byte: 0 = disabled, 1 = enabled, 2 = security quiesce.
pub fn dd_mode_key() -> Vec<u8> {
    b"\xff/ddMode".to_vec()
}

pub fn move_keys_lock_owner_key() -> Vec<u8> {
    b"\xff/moveKeysLock/owner".to_vec()
}

pub fn move_keys_lock_write_key() -> Vec<u8> {
    b"\xff/moveKeysLock/write".to_vec()
}

/// Set while a cluster snapshot is being taken, cleared afterwards.
pub fn write_recovery_key() -> Vec<u8> {
    b"\xff/writeRecovery".to_vec()
}

/// Range map holding one `ShardAssignment` per shard of the user keyspace.
pub fn key_servers_prefix() -> Vec<u8> {
    b"\xff/keyServers/".to_vec()
}

/// Range map of per-range replication overrides (`UserRangeConfig`).
pub fn user_range_config_prefix() -> Vec<u8> {
    b"\xff/ddConfig/userReplication/".to_vec()
}

pub fn data_move_prefix() -> Vec<u8> {
    b"\xff/dataMoves/".to_vec()
}

pub fn data_move_key(id: Uid) -> Vec<u8> {
    let mut k = data_move_prefix();
    k.extend_from_slice(id.as_bytes());
    k
}

pub fn server_list_prefix() -> Vec<u8> {
    b"\xff/serverList/".to_vec()
}

pub fn server_list_key(id: Uid) -> Vec<u8> {
    let mut k = server_list_prefix();
    k.extend_from_slice(id.as_bytes());
    k
}

pub fn tlog_list_prefix() -> Vec<u8> {
    b"\xff/tlogs/".to_vec()
}

pub fn tlog_list_key(id: Uid) -> Vec<u8> {
    let mut k = tlog_list_prefix();
    k.extend_from_slice(id.as_bytes());
    k
}

/// JSON list of coordinator addresses.
pub fn coordinators_key() -> Vec<u8> {
    b"\xff/coordinators".to_vec()
}

/// Cluster configuration options, one key per option name.
pub fn config_key(option: &str) -> Vec<u8> {
    let mut k = b"\xff/conf/".to_vec();
    k.extend_from_slice(option.as_bytes());
    k
}

/// Present iff this cluster is registered in a metacluster.
pub fn metacluster_registration_key() -> Vec<u8> {
    b"\xff/metacluster/registration".to_vec()
}

fn audit_type_code(ty: AuditType) -> u8 {
    match ty {
        AuditType::ValidateHa => b'h',
        AuditType::ValidateReplica => b'r',
        AuditType::ValidateLocationMetadata => b'l',
        AuditType::ValidateStorageServerShard => b's',
    }
}

pub fn audit_prefix() -> Vec<u8> {
    b"\xff/audits/".to_vec()
}

pub fn audit_type_prefix(ty: AuditType) -> Vec<u8> {
    let mut k = audit_prefix();
    k.push(audit_type_code(ty));
    k.push(b'/');
    k
}

/// Audit ids are sequential per type; big-endian keeps range scans ordered.
pub fn audit_key(ty: AuditType, id: u64) -> Vec<u8> {
    let mut k = audit_type_prefix(ty);
    k.extend_from_slice(&id.to_be_bytes());
    k
}

pub fn decode_audit_id(key: &[u8], ty: AuditType) -> Option<u64> {
    let prefix = audit_type_prefix(ty);
    let tail = key.strip_prefix(prefix.as_slice())?;
    let bytes: [u8; 8] = tail.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Range-based progress namespace: replica/ha/location-metadata audits.
pub fn audit_range_progress_prefix(ty: AuditType, id: u64) -> Vec<u8> {
    let mut k = b"\xff/auditProgress/range/".to_vec();
    k.push(audit_type_code(ty));
    k.push(b'/');
    k.extend_from_slice(&id.to_be_bytes());
    k.push(b'/');
    k
}

/// Server-based progress namespace: per-server shard-map audits.
pub fn audit_server_progress_prefix(ty: AuditType, id: u64, server: Uid) -> Vec<u8> {
    let mut k = audit_server_progress_scan_prefix(ty, id);
    k.extend_from_slice(server.as_bytes());
    k.push(b'/');
    k
}

/// Prefix covering every server's progress rows for one audit.
pub fn audit_server_progress_scan_prefix(ty: AuditType, id: u64) -> Vec<u8> {
    let mut k = b"\xff/auditProgress/server/".to_vec();
    k.push(audit_type_code(ty));
    k.push(b'/');
    k.extend_from_slice(&id.to_be_bytes());
    k.push(b'/');
    k
}

// Tenant metadata family.

pub fn tenant_map_prefix() -> Vec<u8> {
    b"\xff/tenant/map/".to_vec()
}

pub fn tenant_map_key(id: i64) -> Vec<u8> {
    let mut k = tenant_map_prefix();
    k.extend_from_slice(&(id as u64).to_be_bytes());
    k
}

pub fn tenant_name_index_prefix() -> Vec<u8> {
    b"\xff/tenant/name/".to_vec()
}

pub fn tenant_name_index_key(name: &[u8]) -> Vec<u8> {
    let mut k = tenant_name_index_prefix();
    k.extend_from_slice(name);
    k
}

pub fn tenant_group_map_prefix() -> Vec<u8> {
    b"\xff/tenant/group/".to_vec()
}

pub fn tenant_group_map_key(group: &[u8]) -> Vec<u8> {
    let mut k = tenant_group_map_prefix();
    k.extend_from_slice(group);
    k
}

/// `(group, name, id)` tuple index. Group and name are length-prefixed so the
/// tuple ordering survives arbitrary name bytes.
pub fn tenant_group_index_key(group: &[u8], name: &[u8], id: i64) -> Vec<u8> {
    let mut k = tenant_group_index_scan_prefix(group);
    k.extend_from_slice(&(name.len() as u32).to_be_bytes());
    k.extend_from_slice(name);
    k.extend_from_slice(&(id as u64).to_be_bytes());
    k
}

pub fn tenant_group_index_scan_prefix(group: &[u8]) -> Vec<u8> {
    let mut k = b"\xff/tenant/groupIndex/".to_vec();
    k.extend_from_slice(&(group.len() as u32).to_be_bytes());
    k.extend_from_slice(group);
    k
}

pub fn tenant_tombstone_prefix() -> Vec<u8> {
    b"\xff/tenant/tombstone/".to_vec()
}

pub fn tenant_tombstone_key(id: i64) -> Vec<u8> {
    let mut k = tenant_tombstone_prefix();
    k.extend_from_slice(&(id as u64).to_be_bytes());
    k
}

pub fn decode_tenant_tombstone_id(key: &[u8]) -> Option<i64> {
    let tail = key.strip_prefix(tenant_tombstone_prefix().as_slice())?;
    let bytes: [u8; 8] = tail.try_into().ok()?;
    Some(u64::from_be_bytes(bytes) as i64)
}

pub fn tenant_last_id_key() -> Vec<u8> {
    b"\xff/tenant/lastId".to_vec()
}

pub fn tenant_id_prefix_key() -> Vec<u8> {
    b"\xff/tenant/idPrefix".to_vec()
}

pub fn tenant_count_key() -> Vec<u8> {
    b"\xff/tenant/count".to_vec()
}

pub fn tenant_last_modification_key() -> Vec<u8> {
    b"\xff/tenant/lastModification".to_vec()
}

pub fn tenant_tombstone_cleanup_key() -> Vec<u8> {
    b"\xff/tenant/tombstoneCleanup".to_vec()
}

pub fn tenant_quota_key(id: i64) -> Vec<u8> {
    let mut k = b"\xff/tenant/quota/".to_vec();
    k.extend_from_slice(&(id as u64).to_be_bytes());
    k
}

pub fn tenant_quota_prefix() -> Vec<u8> {
    b"\xff/tenant/quota/".to_vec()
}

pub fn tenant_usage_key(id: i64) -> Vec<u8> {
    let mut k = b"\xff/tenant/usage/".to_vec();
    k.extend_from_slice(&(id as u64).to_be_bytes());
    k
}

pub fn encode_u64(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

pub fn decode_u64(v: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = v.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub fn encode_i64(v: i64) -> Vec<u8> {
    encode_u64(v as u64)
}

pub fn decode_i64(v: &[u8]) -> Option<i64> {
    decode_u64(v).map(|x| x as i64)
}

/// First key after every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // All 0xff: no upper bound below the absolute end of keyspace.
    vec![0xff; prefix.len() + 1]
}
