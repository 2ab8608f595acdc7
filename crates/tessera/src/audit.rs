//! The audit engine.
//!
//! One live audit per type at a time. An audit fans out tasks to storage
//! servers under a concurrency budget, persists idempotent progress records,
//! retries transient failures up to a budget, and lands in exactly one final
//! phase: `Complete` (progress cleared), `Error` (an inconsistency was
//! found, progress retained), or `Failed` (retries exhausted, progress
//! retained). A `Running` row on disk with no live job is resumed by the
//! next distributor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::audit_meta::{
    cancel_audit_metadata, check_audit_progress_complete, clear_audit_metadata_for_type,
    get_audit_progress_by_range, get_audit_progress_by_server, init_audit_metadata,
    persist_audit_progress_by_range, persist_audit_progress_by_server, persist_audit_state,
    persist_new_audit_state, AuditPhase, AuditState,
};
use crate::error::{Error, Result};
use crate::keys;
use crate::knobs::Knobs;
use crate::lock::MoveKeysLock;
use crate::queue::ShardAssignment;
use crate::snapshot::DdEnabledState;
use crate::store::{rangemap_get, SystemStore};
use crate::teams::{read_server_list, StorageServerInfo};
use crate::transport::{AuditTaskRequest, ClusterTransport};
use crate::{AuditType, KeyRange, Uid};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditContext {
    Launch,
    Resume,
    Retry,
}

/// Child-task set of one audit generation. Tasks may add further tasks while
/// running; `wait_all` resolves once everything added has settled, or
/// surfaces the first task error.
pub(crate) struct ActorCollection {
    tx: mpsc::UnboundedSender<tokio::task::JoinHandle<Result<()>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<tokio::task::JoinHandle<Result<()>>>>,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl ActorCollection {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            aborts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, fut: BoxFuture<'static, Result<()>>) {
        let handle = tokio::spawn(fut);
        self.aborts.lock().unwrap().push(handle.abort_handle());
        let _ = self.tx.send(handle);
    }

    async fn wait_all(&self) -> Result<()> {
        let mut rx = self.rx.lock().await;
        let mut running = FuturesUnordered::new();
        loop {
            while let Ok(handle) = rx.try_recv() {
                running.push(handle);
            }
            if running.is_empty() {
                // A finished task enqueues its additions before completing,
                // so an empty set with an empty channel means quiescence.
                match rx.try_recv() {
                    Ok(handle) => {
                        running.push(handle);
                        continue;
                    }
                    Err(_) => return Ok(()),
                }
            }
            match running.next().await {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => {
                    if !join_err.is_cancelled() {
                        return Err(Error::Internal(format!("audit task panicked: {join_err}")));
                    }
                }
                None => {}
            }
        }
    }

    fn clear(&self) {
        for handle in self.aborts.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// In-memory state of one live audit generation.
pub struct AuditJob {
    pub state: AuditState,
    pub(crate) actors: ActorCollection,
    pub found_error: AtomicBool,
    pub any_child_failed: AtomicBool,
    pub retry_count: AtomicU32,
    pub cancelled: AtomicBool,
    pub issued_count: AtomicI64,
    pub completed_count: AtomicI64,
    pub budget: Semaphore,
    pub budget_max: usize,
    pub context: AuditContext,
    root: Mutex<Option<AbortHandle>>,
}

impl AuditJob {
    fn new(state: AuditState, retry_count: u32, context: AuditContext, budget_max: usize) -> Arc<Self> {
        Arc::new(Self {
            state,
            actors: ActorCollection::new(),
            found_error: AtomicBool::new(false),
            any_child_failed: AtomicBool::new(false),
            retry_count: AtomicU32::new(retry_count),
            cancelled: AtomicBool::new(false),
            issued_count: AtomicI64::new(0),
            completed_count: AtomicI64::new(0),
            budget: Semaphore::new(budget_max),
            budget_max,
            context,
            root: Mutex::new(None),
        })
    }

    /// Remaining concurrency budget; always within `[0, budget_max]`.
    pub fn remaining_budget(&self) -> usize {
        self.budget.available_permits()
    }

    /// Cancel the root and drain the child set.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.root.lock().unwrap().take() {
            handle.abort();
        }
        self.actors.clear();
    }

    async fn acquire_budget(&self) -> Result<()> {
        match self.budget.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(Error::AuditStorageCancelled),
        }
    }

    async fn wait_budget_available(&self) -> Result<()> {
        match self.budget.acquire().await {
            Ok(_permit) => Ok(()),
            Err(_) => Err(Error::AuditStorageCancelled),
        }
    }

    fn release_budget(&self) {
        self.budget.add_permits(1);
        debug_assert!(self.budget.available_permits() <= self.budget_max);
    }
}

pub struct AuditEngine {
    store: Arc<SystemStore>,
    transport: Arc<dyn ClusterTransport>,
    knobs: Knobs,
    enabled: Arc<DdEnabledState>,
    dd_id: Uid,
    lock: MoveKeysLock,
    audits: Mutex<HashMap<AuditType, HashMap<u64, Arc<AuditJob>>>>,
    launching_locks: [tokio::sync::Mutex<()>; 4],
    init_tx: watch::Sender<bool>,
    init_rx: watch::Receiver<bool>,
}

fn type_index(ty: AuditType) -> usize {
    AuditType::ALL.iter().position(|t| *t == ty).expect("known audit type")
}

impl AuditEngine {
    pub fn new(
        store: Arc<SystemStore>,
        transport: Arc<dyn ClusterTransport>,
        knobs: Knobs,
        enabled: Arc<DdEnabledState>,
        dd_id: Uid,
        lock: MoveKeysLock,
    ) -> Arc<Self> {
        let (init_tx, init_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            transport,
            knobs,
            enabled,
            dd_id,
            lock,
            audits: Mutex::new(HashMap::new()),
            launching_locks: std::array::from_fn(|_| tokio::sync::Mutex::new(())),
            init_tx,
            init_rx,
        })
    }

    /// Resume every persisted `Running` audit and prune finished rows, then
    /// open the engine for launch requests.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let to_resume = init_audit_metadata(
            &self.store,
            &self.lock,
            &self.enabled,
            self.dd_id,
            self.knobs.persist_finish_audit_count,
        )
        .await?;
        for state in to_resume {
            if state.phase != AuditPhase::Running {
                warn!(audit_id = state.id, phase = ?state.phase, "skipping non-running audit at resume");
                continue;
            }
            if self.job_exists(state.audit_type, state.id) {
                continue;
            }
            info!(
                audit_id = state.id,
                audit_type = ?state.audit_type,
                range = ?state.range,
                "resuming audit"
            );
            self.run_audit_storage(state, 0, AuditContext::Resume);
        }
        let _ = self.init_tx.send(true);
        Ok(())
    }

    async fn wait_initialized(&self) {
        let mut rx = self.init_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Cancel every live audit; used when the distributor tears a
    /// generation down. Rows stay `Running` on disk for the next resume.
    pub fn cancel_all(&self) {
        let mut audits = self.audits.lock().unwrap();
        for per_type in audits.values_mut() {
            for (_, job) in per_type.drain() {
                job.cancel();
            }
        }
    }

    pub fn live_audit_ids(&self, ty: AuditType) -> Vec<u64> {
        self.audits
            .lock()
            .unwrap()
            .get(&ty)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn job(&self, ty: AuditType, id: u64) -> Option<Arc<AuditJob>> {
        self.audits.lock().unwrap().get(&ty).and_then(|m| m.get(&id)).cloned()
    }

    fn job_exists(&self, ty: AuditType, id: u64) -> bool {
        self.job(ty, id).is_some()
    }

    fn insert_job(&self, job: Arc<AuditJob>) {
        let ty = job.state.audit_type;
        let id = job.state.id;
        let mut audits = self.audits.lock().unwrap();
        let per_type = audits.entry(ty).or_default();
        debug_assert!(!per_type.contains_key(&id), "duplicate live audit");
        per_type.insert(id, job);
    }

    fn remove_from_map(&self, ty: AuditType, id: u64) {
        let job = {
            let mut audits = self.audits.lock().unwrap();
            audits.get_mut(&ty).and_then(|m| m.remove(&id))
        };
        if let Some(job) = job {
            job.cancel();
        }
    }

    /// The single entry point that starts a live audit: at launch, at resume,
    /// and on each retry generation.
    pub fn run_audit_storage(self: &Arc<Self>, mut state: AuditState, retry_count: u32, context: AuditContext) {
        debug_assert!(state.id != 0, "audit id must be allocated");
        debug_assert!(!state.range.is_empty(), "audit range must be non-empty");
        debug_assert_eq!(state.phase, AuditPhase::Running);
        // Claim the audit for this distributor regardless of who wrote it.
        state.dd_id = self.dd_id;
        let job = AuditJob::new(
            state,
            retry_count,
            context,
            self.knobs.concurrent_audit_task_count_max,
        );
        self.insert_job(Arc::clone(&job));

        let engine = Arc::clone(self);
        let core_job = Arc::clone(&job);
        let handle = tokio::spawn(async move {
            engine.audit_storage_core(core_job, retry_count).await;
        });
        *job.root.lock().unwrap() = Some(handle.abort_handle());
    }

    /// Serve one external trigger: cancel, or launch with bounded retries.
    pub async fn handle_trigger(
        self: &Arc<Self>,
        range: KeyRange,
        ty: AuditType,
        cancel: bool,
        id: Option<u64>,
    ) -> Result<u64> {
        let _guard = self.launching_locks[type_index(ty)].lock().await;
        if cancel {
            let id = id.ok_or(Error::OperationFailed)?;
            debug!(audit_type = ?ty, audit_id = id, "cancelling audit");
            cancel_audit_metadata(&self.store, ty, id).await?;
            if self.job_exists(ty, id) {
                self.remove_from_map(ty, id);
            }
            return Ok(id);
        }

        if range.is_empty() {
            return Err(Error::AuditStorageFailed);
        }
        let mut retries = 0;
        loop {
            match self.launch_audit(range.clone(), ty).await {
                Ok(id) => return Ok(id),
                Err(Error::AuditExceededRequestLimit) => {
                    return Err(Error::AuditExceededRequestLimit)
                }
                Err(Error::PersistNewAuditMetadata) => return Err(Error::AuditStorageFailed),
                Err(err) => {
                    if retries >= self.knobs.audit_retry_count_max {
                        warn!(audit_type = ?ty, error = %err, "audit launch exhausted retries");
                        return Err(Error::AuditStorageFailed);
                    }
                    retries += 1;
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// Get-or-launch: an existing live audit whose range contains the
    /// request is reused; any other live audit of the type rejects the
    /// request; otherwise a fresh id is allocated and the audit started.
    async fn launch_audit(self: &Arc<Self>, range: KeyRange, ty: AuditType) -> Result<u64> {
        self.wait_initialized().await;
        {
            let audits = self.audits.lock().unwrap();
            if let Some(per_type) = audits.get(&ty) {
                if !per_type.is_empty() {
                    for job in per_type.values() {
                        if job.state.range.contains(&range) {
                            info!(
                                audit_type = ?ty,
                                audit_id = job.state.id,
                                "reusing live audit for contained range"
                            );
                            return Ok(job.state.id);
                        }
                    }
                    return Err(Error::AuditExceededRequestLimit);
                }
            }
        }

        let mut state = AuditState::new(ty, range, self.dd_id);
        let id = persist_new_audit_state(&self.store, &self.lock, &self.enabled, &state).await?;
        state.id = id;

        // Trim finished audits beyond the retention count in the background.
        let store = Arc::clone(&self.store);
        let keep = self.knobs.persist_finish_audit_count;
        tokio::spawn(async move {
            let _ = clear_audit_metadata_for_type(&store, ty, id, keep).await;
        });

        if self.job_exists(ty, id) {
            // A concurrent resume got here first; it owns the launch now.
            return Ok(id);
        }
        self.run_audit_storage(state, 0, AuditContext::Launch);
        Ok(id)
    }

    /// Drive one audit generation to a final phase or a retry generation.
    async fn audit_storage_core(self: Arc<Self>, job: Arc<AuditJob>, generation: u32) {
        let ty = job.state.audit_type;
        let id = job.state.id;
        info!(
            audit_id = id,
            audit_type = ?ty,
            range = ?job.state.range,
            generation,
            context = ?job.context,
            "audit generation starting"
        );

        let outcome = self.run_generation(&job).await;
        match outcome {
            Ok(phase) => {
                let mut final_state = job.state.clone();
                final_state.phase = phase;
                match persist_audit_state(
                    &self.store,
                    &self.lock,
                    &self.enabled,
                    &final_state,
                    "audit-core",
                )
                .await
                {
                    Ok(()) => {
                        info!(
                            audit_id = id,
                            audit_type = ?ty,
                            phase = ?phase,
                            issued = job.issued_count.load(Ordering::Relaxed),
                            completed = job.completed_count.load(Ordering::Relaxed),
                            "audit finished"
                        );
                        self.remove_from_map(ty, id);
                    }
                    Err(Error::AuditStorageCancelled) => {
                        // Whoever cancelled the audit removes it from the map.
                    }
                    Err(Error::MoveKeysConflict) => {
                        self.remove_from_map(ty, id);
                    }
                    Err(err) => self.retry_or_fail(&job, err).await,
                }
            }
            Err(Error::AuditStorageCancelled) => {
                // Normally the canceller removed the audit already; a retry
                // generation that raced past the cancel cleans up after
                // itself.
                if let Some(current) = self.job(ty, id) {
                    if Arc::ptr_eq(&current, &job) {
                        self.remove_from_map(ty, id);
                    }
                }
            }
            Err(Error::MoveKeysConflict) => self.remove_from_map(ty, id),
            Err(err) => {
                if job.cancelled.load(Ordering::SeqCst) {
                    return;
                }
                self.retry_or_fail(&job, err).await;
            }
        }
    }

    /// One dispatch-and-settle pass. `Ok` carries the final phase; an error
    /// asks for a retry generation (or failure once retries run out).
    async fn run_generation(self: &Arc<Self>, job: &Arc<AuditJob>) -> Result<AuditPhase> {
        let ty = job.state.audit_type;
        let id = job.state.id;

        self.load_and_dispatch(job);
        job.actors.wait_all().await?;
        debug!(
            audit_id = id,
            issued = job.issued_count.load(Ordering::Relaxed),
            completed = job.completed_count.load(Ordering::Relaxed),
            "audit child tasks settled"
        );
        job.issued_count.store(0, Ordering::Relaxed);
        job.completed_count.store(0, Ordering::Relaxed);

        if job.found_error.load(Ordering::SeqCst) {
            return Ok(AuditPhase::Error);
        }
        if job.any_child_failed.swap(false, Ordering::SeqCst) {
            return Err(Error::OperationFailed);
        }
        if matches!(
            ty,
            AuditType::ValidateHa | AuditType::ValidateReplica | AuditType::ValidateLocationMetadata
        ) {
            // Double-check persisted coverage: a hole means a range was
            // skipped and the generation must run again.
            let covered =
                check_audit_progress_complete(&self.store, ty, id, &job.state.range).await?;
            if !covered {
                return Err(Error::OperationFailed);
            }
        }
        Ok(AuditPhase::Complete)
    }

    async fn retry_or_fail(self: &Arc<Self>, job: &Arc<AuditJob>, err: Error) {
        let ty = job.state.audit_type;
        let id = job.state.id;
        let retries = job.retry_count.load(Ordering::SeqCst);
        if retries < self.knobs.audit_retry_count_max {
            debug!(audit_id = id, audit_type = ?ty, error = %err, retries, "audit retrying");
            job.actors.clear();
            tokio::time::sleep(RETRY_BACKOFF).await;
            if job.cancelled.load(Ordering::SeqCst) {
                return;
            }
            // The new generation inherits the core state; the old job makes
            // way for it in the map.
            self.remove_from_map(ty, id);
            self.run_audit_storage(job.state.clone(), retries + 1, AuditContext::Retry);
        } else {
            let mut failed = job.state.clone();
            failed.phase = AuditPhase::Failed;
            if let Err(persist_err) = persist_audit_state(
                &self.store,
                &self.lock,
                &self.enabled,
                &failed,
                "audit-core-failed",
            )
            .await
            {
                // The row stays Running on disk with no live job: a zombie
                // audit, resumed by the next distributor.
                warn!(
                    audit_id = id,
                    audit_type = ?ty,
                    error = %persist_err,
                    "failed to persist audit failure"
                );
            } else {
                warn!(audit_id = id, audit_type = ?ty, error = %err, "audit failed");
            }
            self.remove_from_map(ty, id);
        }
    }

    fn load_and_dispatch(self: &Arc<Self>, job: &Arc<AuditJob>) {
        let engine = Arc::clone(self);
        let job = Arc::clone(job);
        match job.state.audit_type {
            AuditType::ValidateHa | AuditType::ValidateReplica => {
                let range = job.state.range.clone();
                job.actors
                    .add(dispatch_ranges(engine, Arc::clone(&job), range).boxed());
            }
            AuditType::ValidateLocationMetadata => {
                job.actors
                    .add(dispatch_ranges(engine, Arc::clone(&job), KeyRange::all()).boxed());
            }
            AuditType::ValidateStorageServerShard => {
                job.actors
                    .add(dispatch_server_shard(engine, Arc::clone(&job)).boxed());
            }
        }
    }
}

/// Split `range` by persisted progress and schedule the unaudited pieces.
/// Failures latch `any_child_failed` so the core retries the generation.
async fn dispatch_ranges(engine: Arc<AuditEngine>, job: Arc<AuditJob>, range: KeyRange) -> Result<()> {
    let ty = job.state.audit_type;
    let id = job.state.id;
    let result: Result<()> = async {
        let states = get_audit_progress_by_range(&engine.store, ty, id, &range).await?;
        for state in states {
            match state.phase {
                AuditPhase::Complete => {}
                AuditPhase::Error => {
                    job.found_error.store(true, Ordering::SeqCst);
                }
                AuditPhase::Invalid => {
                    job.wait_budget_available().await?;
                    job.actors.add(schedule_audit_on_range(
                        Arc::clone(&engine),
                        Arc::clone(&job),
                        state.range.clone(),
                    ));
                }
                AuditPhase::Running | AuditPhase::Failed => {
                    return Err(Error::Internal(format!(
                        "unexpected progress phase {:?}",
                        state.phase
                    )));
                }
            }
        }
        Ok(())
    }
    .await;
    if let Err(err) = result {
        if err == Error::AuditStorageCancelled {
            return Err(err);
        }
        warn!(audit_id = id, audit_type = ?ty, error = %err, "audit dispatch failed");
        job.any_child_failed.store(true, Ordering::SeqCst);
    }
    Ok(())
}

/// Schedule tasks for one unaudited range: walk the shard map, pick an
/// executor and comparison targets per shard according to the audit type,
/// and issue budget-gated tasks. Returns a boxed future because failed
/// tasks re-enter here.
fn schedule_audit_on_range(
    engine: Arc<AuditEngine>,
    job: Arc<AuditJob>,
    range_to_schedule: KeyRange,
) -> BoxFuture<'static, Result<()>> {
    async move {
        let ty = job.state.audit_type;
        let id = job.state.id;
        let result: Result<()> = async {
            let (shards, servers) = {
                let range = range_to_schedule.clone();
                engine
                    .store
                    .run_txn(move |tr| {
                        let shards = rangemap_get(tr, &keys::key_servers_prefix(), &range);
                        let servers = read_server_list(tr)?;
                        Ok((shards, servers))
                    })
                    .await?
            };
            let by_id: HashMap<Uid, &StorageServerInfo> =
                servers.iter().map(|s| (s.id, s)).collect();

            for shard in shards {
                let assignment = ShardAssignment::decode(&shard.value);
                let progress =
                    get_audit_progress_by_range(&engine.store, ty, id, &shard.range).await?;
                for state in progress {
                    if state.phase != AuditPhase::Invalid {
                        if state.phase == AuditPhase::Error {
                            job.found_error.store(true, Ordering::SeqCst);
                        }
                        continue;
                    }
                    let Some((executor, targets)) = select_task_servers(ty, &assignment, &by_id)
                    else {
                        // Single replica: nothing to compare against.
                        debug!(audit_id = id, range = ?state.range, "skipping single-replica range");
                        return Ok(());
                    };
                    job.acquire_budget().await?;
                    job.issued_count.fetch_add(1, Ordering::Relaxed);
                    let req = AuditTaskRequest {
                        audit_id: id,
                        audit_type: ty,
                        range: state.range.clone(),
                        target_servers: targets,
                        dd_id: engine.dd_id,
                    };
                    job.actors.add(do_audit_on_storage_server(
                        Arc::clone(&engine),
                        Arc::clone(&job),
                        executor,
                        req,
                    ));
                }
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            if err == Error::AuditStorageCancelled {
                return Err(err);
            }
            warn!(audit_id = id, audit_type = ?ty, error = %err, "audit range scheduling failed");
            job.any_child_failed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
    .boxed()
}

/// Pick the executor and comparison targets for one task range. `None`
/// means the range cannot be audited (single replica) and is skipped.
fn select_task_servers(
    ty: AuditType,
    assignment: &ShardAssignment,
    servers: &HashMap<Uid, &StorageServerInfo>,
) -> Option<(Uid, Vec<Uid>)> {
    let mut rng = rand::thread_rng();
    let primary: Vec<Uid> = assignment
        .src_primary
        .iter()
        .copied()
        .filter(|id| servers.contains_key(id))
        .collect();
    let remote: Vec<Uid> = assignment
        .src_remote
        .iter()
        .copied()
        .filter(|id| servers.contains_key(id))
        .collect();

    match ty {
        AuditType::ValidateHa => {
            if remote.is_empty() {
                return None;
            }
            let executor = *primary.choose(&mut rng)?;
            let target = *remote.choose(&mut rng)?;
            Some((executor, vec![target]))
        }
        AuditType::ValidateReplica => {
            if primary.len() < 2 {
                return None;
            }
            let executor = *primary.choose(&mut rng)?;
            let targets = primary.iter().copied().filter(|id| *id != executor).collect();
            Some((executor, targets))
        }
        AuditType::ValidateLocationMetadata => {
            let executor = *primary.choose(&mut rng)?;
            Some((executor, Vec::new()))
        }
        AuditType::ValidateStorageServerShard => None,
    }
}

/// Per-server shard-map audit: one budget-gated scheduler per non-TSS
/// server, each auditing the whole keyspace serially.
async fn dispatch_server_shard(engine: Arc<AuditEngine>, job: Arc<AuditJob>) -> Result<()> {
    let id = job.state.id;
    let result: Result<()> = async {
        let servers = engine.store.run_txn(read_server_list).await?;
        for server in servers.into_iter().filter(|s| !s.is_tss) {
            job.wait_budget_available().await?;
            job.actors.add(schedule_server_shard(
                Arc::clone(&engine),
                Arc::clone(&job),
                server.id,
            ));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
    .await;
    if let Err(err) = result {
        if err == Error::AuditStorageCancelled {
            return Err(err);
        }
        warn!(audit_id = id, error = %err, "server shard dispatch failed");
        job.any_child_failed.store(true, Ordering::SeqCst);
    }
    Ok(())
}

/// Per-server scheduler, boxed because its retry path re-enters itself.
fn schedule_server_shard(
    engine: Arc<AuditEngine>,
    job: Arc<AuditJob>,
    server: Uid,
) -> BoxFuture<'static, Result<()>> {
    async move {
        let ty = job.state.audit_type;
        let id = job.state.id;
        let result: Result<()> = async {
            let states =
                get_audit_progress_by_server(&engine.store, ty, id, server, &KeyRange::all())
                    .await?;
            for state in states {
                match state.phase {
                    AuditPhase::Complete => {}
                    AuditPhase::Error => {
                        job.found_error.store(true, Ordering::SeqCst);
                    }
                    AuditPhase::Invalid => {
                        job.acquire_budget().await?;
                        job.issued_count.fetch_add(1, Ordering::Relaxed);
                        let req = AuditTaskRequest {
                            audit_id: id,
                            audit_type: ty,
                            range: state.range.clone(),
                            target_servers: Vec::new(),
                            dd_id: engine.dd_id,
                        };
                        // One task at a time per server; the remainder of the
                        // keyspace is always one contiguous unaudited run.
                        do_audit_on_storage_server(
                            Arc::clone(&engine),
                            Arc::clone(&job),
                            server,
                            req,
                        )
                        .await?;
                    }
                    AuditPhase::Running | AuditPhase::Failed => {
                        return Err(Error::Internal(format!(
                            "unexpected progress phase {:?}",
                            state.phase
                        )));
                    }
                }
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(Error::AuditStorageCancelled) => Err(Error::AuditStorageCancelled),
            Err(Error::AuditStorageError) => {
                job.found_error.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                if job.retry_count.load(Ordering::SeqCst) >= engine.knobs.audit_retry_count_max {
                    return Err(Error::AuditStorageFailed);
                }
                // The server may simply be gone; that is a clean success.
                let removed = engine
                    .store
                    .run_txn(|tr| Ok(!crate::teams::server_exists(tr, server)))
                    .await
                    .unwrap_or(false);
                if removed {
                    debug!(audit_id = id, server = %server, "audited server was removed");
                    return Ok(());
                }
                warn!(audit_id = id, server = %server, error = %err, "per-server audit retrying");
                job.retry_count.fetch_add(1, Ordering::SeqCst);
                job.actors.add(schedule_server_shard(
                    Arc::clone(&engine),
                    Arc::clone(&job),
                    server,
                ));
                Ok(())
            }
        }
    }
    .boxed()
}

/// The single interface to a storage server for every audit type: issue the
/// task with a bounded failure window, persist its progress, and classify
/// the outcome. Boxed: task failure re-enters the range scheduler, which in
/// turn issues tasks through here.
fn do_audit_on_storage_server(
    engine: Arc<AuditEngine>,
    job: Arc<AuditJob>,
    server: Uid,
    req: AuditTaskRequest,
) -> BoxFuture<'static, Result<()>> {
    async move {
        let ty = req.audit_type;
        let id = req.audit_id;
        debug_assert!(!req.dd_id.is_nil());

        let reply = match tokio::time::timeout(
            engine.knobs.audit_storage_failure_window,
            engine.transport.audit_storage(server, req.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::AuditStorageFailed),
        };
        job.release_budget();

        match reply {
            Ok(()) => {
                let progress = AuditState {
                    id,
                    audit_type: ty,
                    range: req.range.clone(),
                    phase: AuditPhase::Complete,
                    dd_id: engine.dd_id,
                    error: None,
                };
                if ty == AuditType::ValidateStorageServerShard {
                    persist_audit_progress_by_server(&engine.store, &progress, server).await?;
                } else {
                    persist_audit_progress_by_range(&engine.store, &progress).await?;
                }
                job.completed_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                debug!(
                    audit_id = id,
                    audit_type = ?ty,
                    server = %server,
                    range = ?req.range,
                    error = %err,
                    "audit task failed"
                );
                if ty == AuditType::ValidateStorageServerShard {
                    // The per-server scheduler owns retry and removal
                    // handling.
                    return Err(err);
                }
                match err {
                    Error::NotImplemented
                    | Error::AuditExceededRequestLimit
                    | Error::AuditStorageCancelled => Err(err),
                    Error::AuditStorageError => {
                        job.found_error.store(true, Ordering::SeqCst);
                        let progress = AuditState {
                            id,
                            audit_type: ty,
                            range: req.range.clone(),
                            phase: AuditPhase::Error,
                            dd_id: engine.dd_id,
                            error: Some("storage server reported inconsistency".to_string()),
                        };
                        persist_audit_progress_by_range(&engine.store, &progress).await?;
                        Ok(())
                    }
                    _ => {
                        if job.retry_count.load(Ordering::SeqCst)
                            >= engine.knobs.audit_retry_count_max
                        {
                            return Err(Error::AuditStorageFailed);
                        }
                        // Re-enqueue the range, not the server: the shard may
                        // have moved since this task was issued.
                        job.retry_count.fetch_add(1, Ordering::SeqCst);
                        job.actors.add(schedule_audit_on_range(
                            Arc::clone(&engine),
                            Arc::clone(&job),
                            req.range.clone(),
                        ));
                        Ok(())
                    }
                }
            }
        }
    }
    .boxed()
}
