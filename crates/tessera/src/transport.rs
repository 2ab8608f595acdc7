//! RPC seam between the distributor and the rest of the cluster.
//!
//! The wire protocol to storage servers and stateful workers belongs to the
//! surrounding system; the distributor only needs the handful of requests it
//! originates. Tests install `TestTransport` and program replies directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::snapshot::WorkerRole;
use crate::{AuditType, KeyRange, Uid};

/// One audit task executed by a storage server.
#[derive(Clone, Debug)]
pub struct AuditTaskRequest {
    pub audit_id: u64,
    pub audit_type: AuditType,
    pub range: KeyRange,
    /// Servers the executor compares itself against (replica and HA audits).
    pub target_servers: Vec<Uid>,
    /// The distributor issuing this task; stale tasks from a dead
    /// distributor are rejected by progress validation.
    pub dd_id: Uid,
}

#[async_trait]
pub trait ClusterTransport: Send + Sync + 'static {
    /// Run one audit task on `server`. `Ok` means the task ran and found no
    /// inconsistency; an inconsistency surfaces as `AuditStorageError`.
    async fn audit_storage(&self, server: Uid, req: AuditTaskRequest) -> Result<()>;

    async fn disable_tlog_pop(&self, tlog: Uid, snap_uid: Uid) -> Result<()>;

    async fn enable_tlog_pop(&self, tlog: Uid, snap_uid: Uid) -> Result<()>;

    async fn snapshot_worker(
        &self,
        addr: &str,
        role: WorkerRole,
        payload: &[u8],
        snap_uid: Uid,
    ) -> Result<()>;
}

type AuditHook = dyn Fn(Uid, &AuditTaskRequest) -> Result<()> + Send + Sync;

/// In-process transport with programmable replies.
#[derive(Default)]
pub struct TestTransport {
    audit_hook: Mutex<Option<Box<AuditHook>>>,
    audit_calls: AtomicU64,
    snapshot_calls: AtomicU64,
    failing_snapshot_addrs: Mutex<HashSet<String>>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the audit reply logic; the default replies `Ok`.
    pub fn set_audit_hook(
        &self,
        hook: impl Fn(Uid, &AuditTaskRequest) -> Result<()> + Send + Sync + 'static,
    ) {
        *self.audit_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn audit_calls(&self) -> u64 {
        self.audit_calls.load(Ordering::Relaxed)
    }

    pub fn snapshot_calls(&self) -> u64 {
        self.snapshot_calls.load(Ordering::Relaxed)
    }

    pub fn fail_snapshots_for(&self, addr: &str) {
        self.failing_snapshot_addrs
            .lock()
            .unwrap()
            .insert(addr.to_string());
    }
}

#[async_trait]
impl ClusterTransport for TestTransport {
    async fn audit_storage(&self, server: Uid, req: AuditTaskRequest) -> Result<()> {
        self.audit_calls.fetch_add(1, Ordering::Relaxed);
        let hook = self.audit_hook.lock().unwrap();
        match hook.as_ref() {
            Some(hook) => hook(server, &req),
            None => Ok(()),
        }
    }

    async fn disable_tlog_pop(&self, _tlog: Uid, _snap_uid: Uid) -> Result<()> {
        Ok(())
    }

    async fn enable_tlog_pop(&self, _tlog: Uid, _snap_uid: Uid) -> Result<()> {
        Ok(())
    }

    async fn snapshot_worker(
        &self,
        addr: &str,
        _role: WorkerRole,
        _payload: &[u8],
        _snap_uid: Uid,
    ) -> Result<()> {
        self.snapshot_calls.fetch_add(1, Ordering::Relaxed);
        if self.failing_snapshot_addrs.lock().unwrap().contains(addr) {
            return Err(crate::Error::OperationFailed);
        }
        Ok(())
    }
}
