//! Snapshot requests are deduplicated by uid: a repeated uid inside the
//! retention window replays the finished result without re-driving the
//! snapshot; after the window a fresh attempt may run.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{cluster_with_servers, server};
use tessera::keys;
use tessera::snapshot::{DdEnabledState, SnapshotManager, WorkerInfo};
use tessera::Uid;

async fn snapshot_manager(
    cluster: &common::Cluster,
    knobs: tessera::Knobs,
) -> Arc<SnapshotManager> {
    // Two tlogs and two coordinators alongside the storage fleet.
    let mut tr = cluster.store.begin();
    for n in 1..=2u8 {
        let tlog = WorkerInfo {
            id: Uid::from_u128(0x1000 + n as u128),
            addr: format!("10.0.1.{n}:4600"),
        };
        tr.set(
            &keys::tlog_list_key(tlog.id),
            &serde_json::to_vec(&tlog).expect("encode tlog"),
        );
    }
    let coordinators = vec!["10.0.2.1:4700".to_string(), "10.0.2.2:4700".to_string()];
    tr.set(
        &keys::coordinators_key(),
        &serde_json::to_vec(&coordinators).expect("encode coordinators"),
    );
    tr.commit().expect("seed workers");

    Arc::new(SnapshotManager::new(
        Arc::clone(&cluster.store),
        cluster.transport.clone(),
        knobs,
        Arc::new(DdEnabledState::new()),
    ))
}

#[tokio::test]
async fn duplicate_uid_replays_the_cached_result() {
    let cluster = cluster_with_servers(
        2,
        vec![server(1, "dc1", "z1"), server(2, "dc1", "z2")],
    )
    .await;
    let mut knobs = tessera::Knobs::default();
    knobs.snap_minimum_time_gap = Duration::from_millis(200);
    let manager = snapshot_manager(&cluster, knobs).await;

    let uid = Uid::new_v4();
    manager.handle(b"snap".to_vec(), uid).await.expect("first snapshot");
    let calls_after_first = cluster.transport.snapshot_calls();
    assert!(calls_after_first > 0);

    // Back-to-back duplicate: cached result, no new worker requests.
    manager.handle(b"snap".to_vec(), uid).await.expect("duplicate");
    assert_eq!(cluster.transport.snapshot_calls(), calls_after_first);

    // After the retention window the same uid may drive a fresh snapshot.
    tokio::time::sleep(Duration::from_millis(400)).await;
    manager.handle(b"snap".to_vec(), uid).await.expect("fresh");
    assert!(cluster.transport.snapshot_calls() > calls_after_first);
}

#[tokio::test]
async fn snapshot_clears_the_recovery_flag_on_success() {
    let cluster = cluster_with_servers(
        2,
        vec![server(1, "dc1", "z1"), server(2, "dc1", "z2")],
    )
    .await;
    let manager = snapshot_manager(&cluster, tessera::Knobs::default()).await;

    manager
        .handle(b"snap".to_vec(), Uid::new_v4())
        .await
        .expect("snapshot");
    let mut tr = cluster.store.begin();
    assert_eq!(tr.get(&keys::write_recovery_key()), None);
}

#[tokio::test]
async fn storage_failures_beyond_tolerance_fail_the_snapshot() {
    let cluster = cluster_with_servers(
        2,
        vec![
            server(1, "dc1", "z1"),
            server(2, "dc1", "z2"),
            server(3, "dc1", "z3"),
        ],
    )
    .await;
    // Tolerance is min(knob, team_size - 1) = 1; two failing servers exceed it.
    cluster.transport.fail_snapshots_for("10.0.0.1:4500");
    cluster.transport.fail_snapshots_for("10.0.0.2:4500");
    let manager = snapshot_manager(&cluster, tessera::Knobs::default()).await;

    let res = manager.handle(b"snap".to_vec(), Uid::new_v4()).await;
    assert_eq!(res, Err(tessera::Error::SnapStorageFailed));
}
