//! Runtime knob registry.
//!
//! A plain value struct handed to the distributor at init time. Nothing here
//! is process-global; tests build a copy and adjust fields directly.

use std::time::Duration;

// Relocation priorities, higher runs first. Recovery moves resumed at boot
// run at the lowest data-movement priority.
pub const PRIORITY_RECOVER_MOVE: i32 = 110;
pub const PRIORITY_REBALANCE_UNDERUTILIZED_TEAM: i32 = 120;
pub const PRIORITY_REBALANCE_OVERUTILIZED_TEAM: i32 = 121;
pub const PRIORITY_TEAM_HEALTHY: i32 = 140;
pub const PRIORITY_TEAM_CONTAINS_UNDESIRED_SERVER: i32 = 150;
pub const PRIORITY_TEAM_REDUNDANT: i32 = 200;
pub const PRIORITY_MERGE_SHARD: i32 = 340;
pub const PRIORITY_TEAM_UNHEALTHY: i32 = 700;
pub const PRIORITY_TEAM_2_LEFT: i32 = 709;
pub const PRIORITY_TEAM_1_LEFT: i32 = 800;
pub const PRIORITY_SPLIT_SHARD: i32 = 950;
pub const PRIORITY_TEAM_0_LEFT: i32 = 999;

/// Tunable limits and intervals for every distributor subsystem.
#[derive(Clone, Debug)]
pub struct Knobs {
    /// Ceiling on concurrently outstanding audit tasks per audit.
    pub concurrent_audit_task_count_max: usize,
    /// Per-audit retry budget before the audit is persisted as failed.
    pub audit_retry_count_max: u32,
    /// Finished (complete/failed) audits retained per audit type.
    pub persist_finish_audit_count: usize,
    /// Sustained-failure window for one audit task RPC.
    pub audit_storage_failure_window: Duration,

    /// Minimum storage-server age before the wiggler will pick it.
    pub dd_storage_wiggle_min_ss_age: Duration,
    /// In-flight cap on relocations executed by the queue.
    pub dd_move_keys_parallelism: usize,
    /// Over-replicated shards tolerated on large teams before a recovery
    /// relocation is enqueued.
    pub dd_max_shards_on_large_teams: usize,

    /// Poll interval while waiting for the distributor mode byte.
    pub dd_enabled_check_delay: Duration,
    /// Interval for re-asserting the move-keys lock.
    pub movekeys_lock_polling_delay: Duration,

    /// Hard cap on the tenant count.
    pub max_tenants_per_cluster: i64,
    /// Minimum gap between tenant tombstone cleanups.
    pub tenant_tombstone_cleanup_interval: Duration,
    /// Perturb allocated tenant ids, exercising sparse id spaces in tests.
    pub tenant_id_random_skew: bool,

    /// Upper bound on one whole snapshot attempt.
    pub snap_create_max_timeout: Duration,
    /// Retention window for finished snapshot results, which also dedups
    /// repeated requests with the same uid.
    pub snap_minimum_time_gap: Duration,
    pub max_storage_snapshot_fault_tolerance: usize,
    pub max_coordinator_snapshot_fault_tolerance: usize,

    /// Location metadata is encoded per physical shard by the storage engine.
    pub shard_encode_location_metadata: bool,
    /// Physical-shard bookkeeping on top of the shard map.
    pub enable_dd_physical_shard: bool,
    /// Interval for the physical-shard monitor pass.
    pub physical_shard_metrics_delay: Duration,

    /// Shard byte size above which the tracker requests a split.
    pub shard_split_bytes: u64,
    /// Combined byte size below which two adjacent shards merge.
    pub shard_merge_bytes: u64,
    /// Sustained write bandwidth (bytes/sec) that forces a write split.
    pub shard_split_write_bandwidth: u64,

    /// Backoff base for failed relocations.
    pub relocation_retry_delay: Duration,
    /// Attempts before a relocation is requeued at recovery priority.
    pub relocation_max_attempts: u32,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            concurrent_audit_task_count_max: 100,
            audit_retry_count_max: 10,
            persist_finish_audit_count: 10,
            audit_storage_failure_window: Duration::from_secs(2),
            dd_storage_wiggle_min_ss_age: Duration::from_secs(600),
            dd_move_keys_parallelism: 15,
            dd_max_shards_on_large_teams: 100,
            dd_enabled_check_delay: Duration::from_secs(1),
            movekeys_lock_polling_delay: Duration::from_secs(5),
            max_tenants_per_cluster: 1_000_000,
            tenant_tombstone_cleanup_interval: Duration::from_secs(60),
            tenant_id_random_skew: false,
            snap_create_max_timeout: Duration::from_secs(300),
            snap_minimum_time_gap: Duration::from_secs(5),
            max_storage_snapshot_fault_tolerance: 1,
            max_coordinator_snapshot_fault_tolerance: 1,
            shard_encode_location_metadata: false,
            enable_dd_physical_shard: false,
            physical_shard_metrics_delay: Duration::from_secs(300),
            shard_split_bytes: 500_000_000,
            shard_merge_bytes: 50_000_000,
            shard_split_write_bandwidth: 35_000_000,
            relocation_retry_delay: Duration::from_millis(250),
            relocation_max_attempts: 10,
        }
    }
}
