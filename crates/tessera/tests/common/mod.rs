//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tessera::distributor::{Distributor, DistributorRequest};
use tessera::keys;
use tessera::queue::ShardAssignment;
use tessera::store::{rangemap_init, rangemap_set, SystemStore};
use tessera::teams::{Locality, StorageEngineKind, StorageServerInfo};
use tessera::transport::TestTransport;
use tessera::{KeyRange, Knobs, Uid};

use tokio::sync::{mpsc, oneshot};

pub struct Cluster {
    pub dir: tempfile::TempDir,
    pub store: Arc<SystemStore>,
    pub transport: Arc<TestTransport>,
    pub knobs: Knobs,
}

pub fn seq_uid(n: u8) -> Uid {
    Uid::from_u128(n as u128)
}

pub fn server(n: u8, dc: &str, zone: &str) -> StorageServerInfo {
    StorageServerInfo {
        id: seq_uid(n),
        addr: format!("10.0.0.{n}:4500"),
        locality: Locality {
            dc: dc.to_string(),
            zone: zone.to_string(),
            machine: format!("m{n}"),
        },
        engine: StorageEngineKind::SsdBtreeV2,
        created_at: 0.0,
        wrong_configured: false,
        is_tss: false,
    }
}

/// A store seeded with configuration and a storage fleet, tenants enabled.
pub async fn cluster_with_servers(team_size: usize, servers: Vec<StorageServerInfo>) -> Cluster {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SystemStore::open(dir.path().join("sys")).expect("open store"));

    let mut tr = store.begin();
    tr.set(
        &keys::config_key("storage_team_size"),
        team_size.to_string().as_bytes(),
    );
    tr.set(&keys::config_key("tenant_mode"), b"2");
    for info in &servers {
        tr.set(
            &keys::server_list_key(info.id),
            &serde_json::to_vec(info).expect("encode server"),
        );
    }
    tr.commit().expect("seed cluster");

    Cluster {
        dir,
        store,
        transport: Arc::new(TestTransport::new()),
        knobs: Knobs::default(),
    }
}

/// Write shard-map assignments (seeding the map first).
pub async fn seed_shard_map(store: &SystemStore, assignments: &[(KeyRange, ShardAssignment)]) {
    let mut tr = store.begin();
    let prefix = keys::key_servers_prefix();
    rangemap_init(&mut tr, &prefix, &ShardAssignment::default().encode());
    for (range, assignment) in assignments {
        rangemap_set(&mut tr, &prefix, range, &assignment.encode());
    }
    tr.commit().expect("seed shard map");
}

pub struct RunningDistributor {
    pub distributor: Arc<Distributor>,
    pub requests: mpsc::Sender<DistributorRequest>,
    pub handle: tokio::task::JoinHandle<tessera::Result<()>>,
}

pub async fn start_distributor(cluster: &Cluster) -> RunningDistributor {
    let distributor = Distributor::new(
        Arc::clone(&cluster.store),
        cluster.transport.clone(),
        cluster.knobs.clone(),
    );
    let (requests, rx) = mpsc::channel(32);
    let handle = tokio::spawn(Arc::clone(&distributor).run(rx));
    RunningDistributor {
        distributor,
        requests,
        handle,
    }
}

impl RunningDistributor {
    /// Wait until the bootstrap sequence has produced live state.
    pub async fn wait_initialized(&self) {
        wait_until(Duration::from_secs(10), || async {
            let (tx, rx) = oneshot::channel();
            let _ = self
                .requests
                .send(DistributorRequest::WigglerState { reply: tx })
                .await;
            matches!(rx.await, Ok(Ok(_)))
        })
        .await;
    }

    pub async fn halt(self) -> tessera::Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .requests
            .send(DistributorRequest::Halt {
                requester: Uid::new_v4(),
                reply: tx,
            })
            .await;
        let _ = rx.await;
        self.handle.await.expect("distributor task")
    }
}

/// Poll `f` until it returns true, panicking at the deadline.
pub async fn wait_until<F, Fut>(timeout: Duration, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
