//! End-to-end bootstrap: a distributor started over a seeded store takes the
//! lock, resumes in-flight work, and finishes the pending relocations.

mod common;

use std::time::Duration;

use common::{cluster_with_servers, seed_shard_map, seq_uid, server, start_distributor, wait_until};
use tessera::distributor::DistributorRequest;
use tessera::queue::ShardAssignment;
use tessera::store::rangemap_get;
use tessera::{keys, KeyRange};
use tokio::sync::oneshot;

#[tokio::test]
async fn bootstrap_serves_requests_and_halts_cleanly() {
    let cluster = cluster_with_servers(
        1,
        vec![server(1, "dc1", "z1"), server(2, "dc1", "z2")],
    )
    .await;
    let running = start_distributor(&cluster).await;
    running.wait_initialized().await;

    // An empty audit range is rejected outright.
    let (tx, rx) = oneshot::channel();
    running
        .requests
        .send(DistributorRequest::TriggerAudit {
            range: KeyRange::new(b"x".to_vec(), b"a".to_vec()),
            audit_type: tessera::AuditType::ValidateReplica,
            cancel: false,
            id: None,
            reply: tx,
        })
        .await
        .expect("send");
    assert_eq!(rx.await.expect("reply"), Err(tessera::Error::AuditStorageFailed));

    running.halt().await.expect("clean halt");
}

#[tokio::test]
async fn resume_finishes_an_anonymous_inflight_move() {
    let cluster = cluster_with_servers(
        1,
        vec![server(1, "dc1", "z1"), server(2, "dc1", "z2")],
    )
    .await;

    // One shard carries a destination with no move metadata: the bootstrap
    // must schedule a recovery relocation and drive it to completion.
    let range = KeyRange::new(b"a".to_vec(), b"m".to_vec());
    seed_shard_map(
        &cluster.store,
        &[(
            range.clone(),
            ShardAssignment {
                src_primary: vec![seq_uid(1)],
                src_remote: vec![],
                dest_id: None,
                dest_primary: vec![seq_uid(2)],
                dest_remote: vec![],
            },
        )],
    )
    .await;

    let running = start_distributor(&cluster).await;
    running.wait_initialized().await;

    // The relocation queue finishes the move: the destination becomes the
    // source and no dest remains anywhere over the range.
    let store = cluster.store.clone();
    wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        let range = range.clone();
        async move {
            let mut tr = store.begin();
            let entries = rangemap_get(&mut tr, &keys::key_servers_prefix(), &range);
            entries.iter().all(|e| {
                let a = ShardAssignment::decode(&e.value);
                !a.has_dest() && !a.src_primary.is_empty()
            })
        }
    })
    .await;

    running.halt().await.expect("clean halt");
}

#[tokio::test]
async fn metrics_requests_reflect_reported_shard_metrics() {
    let cluster = cluster_with_servers(1, vec![server(1, "dc1", "z1")]).await;
    let running = start_distributor(&cluster).await;
    running.wait_initialized().await;

    running
        .distributor
        .report_shard_metrics(&KeyRange::all(), 4096, 0);

    let (tx, rx) = oneshot::channel();
    running
        .requests
        .send(DistributorRequest::GetMetrics {
            keys: KeyRange::all(),
            shard_limit: 100,
            mid_only: false,
            reply: tx,
        })
        .await
        .expect("send");
    let reply = rx.await.expect("reply").expect("metrics");
    assert!(reply.shards.iter().any(|m| m.shard_bytes == 4096));

    let (tx, rx) = oneshot::channel();
    running
        .requests
        .send(DistributorRequest::GetMetrics {
            keys: KeyRange::all(),
            shard_limit: 100,
            mid_only: true,
            reply: tx,
        })
        .await
        .expect("send");
    let reply = rx.await.expect("reply").expect("metrics");
    assert_eq!(reply.mid_shard_size, Some(4096));

    running.halt().await.expect("clean halt");
}

#[tokio::test]
async fn exclusion_safety_check_reports_unsafe_without_spare_teams() {
    let cluster = cluster_with_servers(
        1,
        vec![server(1, "dc1", "z1"), server(2, "dc1", "z2")],
    )
    .await;
    let running = start_distributor(&cluster).await;
    running.wait_initialized().await;

    // Excluding one of two single-server teams leaves only one team.
    let (tx, rx) = oneshot::channel();
    running
        .requests
        .send(DistributorRequest::ExclusionSafetyCheck {
            exclusions: vec!["10.0.0.1:4500".to_string()],
            reply: tx,
        })
        .await
        .expect("send");
    assert!(!rx.await.expect("reply"));

    running.halt().await.expect("clean halt");
}
