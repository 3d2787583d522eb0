use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use partlog_diskqueue::QueueStore;
use partlog_kvstore::KeyValueStore;
use partlog_primitives::{Epoch, LogId, RecruitmentId, StorageTeamId, TLogGroupId};
use rand::Rng as _;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::{
    config::TLogConfig,
    error::TLogError,
    group::GroupData,
    messages::{
        InitializeTLogRequest, TLogCommitReply, TLogCommitRequest, TLogInterface, TLogPeekReply, TLogPeekRequest,
        TLogPopRequest, TLogRequest,
    },
};

/// Cluster information observed by the worker's rejoin loop.
#[derive(Clone, Debug, Default)]
pub struct ClusterInfo {
    /// The newest epoch the cluster controller has recovered to.
    pub recovery_count: Epoch,
    /// Whether that epoch reached full recovery.
    pub fully_recovered: bool,
    /// Generations present in the log system config, including prior
    /// committed log servers still draining.
    pub live_log_ids: HashSet<LogId>,
}

/// Supplies the per-group persistent stores.
///
/// Implementations decide where a group's key/value store and disk-queue
/// files live; the in-memory provider backs tests and the durable engines
/// plug in behind the same trait.
pub trait GroupStores: Send + Sync + 'static {
    type Queue: QueueStore + Send + 'static;

    /// Open (or create) the stores for `group`. Must return handles onto
    /// the same underlying state when called again for the same group.
    fn open_group(&self, group: TLogGroupId) -> io::Result<(Arc<dyn KeyValueStore>, Self::Queue)>;
}

/// In-memory [`GroupStores`]: state survives re-opening a group within the
/// process, which is what recovery tests exercise.
#[cfg(any(test, feature = "test"))]
#[derive(Clone, Default)]
pub struct MemoryStores {
    inner: Arc<Mutex<HashMap<TLogGroupId, (Arc<partlog_kvstore::Memory>, partlog_diskqueue::store::Memory)>>>,
}

#[cfg(any(test, feature = "test"))]
impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "test"))]
impl GroupStores for MemoryStores {
    type Queue = partlog_diskqueue::store::Memory;

    fn open_group(&self, group: TLogGroupId) -> io::Result<(Arc<dyn KeyValueStore>, Self::Queue)> {
        let mut inner = self.inner.lock();
        let (kv, queue) = inner
            .entry(group)
            .or_insert_with(|| {
                (
                    Arc::new(partlog_kvstore::Memory::new()),
                    partlog_diskqueue::store::Memory::new(),
                )
            })
            .clone();
        Ok((kv as Arc<dyn KeyValueStore>, queue))
    }
}

struct ServerInner<S: QueueStore> {
    groups: HashMap<TLogGroupId, Arc<GroupData<S>>>,
    team_routes: HashMap<StorageTeamId, TLogGroupId>,
    recruitments: HashMap<RecruitmentId, TLogInterface>,
    current_epoch: Epoch,
    current_log_ids: Vec<LogId>,
    /// Per-consumer peek sequence enforcement.
    peek_cursors: HashMap<(u128, StorageTeamId), u64>,
}

/// A TLog worker process: a map of groups, endpoint hosting, admission of
/// new generations, and the cluster-liveness loop.
pub struct ServerData<P: GroupStores> {
    pub instance_id: u64,
    config: Arc<TLogConfig>,
    stores: P,
    peek_limiter: Arc<Semaphore>,
    inner: Mutex<ServerInner<P::Queue>>,
    cluster: watch::Receiver<ClusterInfo>,
    removed: watch::Sender<bool>,
    recovery_finished: AtomicBool,
}

impl<P: GroupStores> ServerData<P> {
    /// Construct the worker and start its cluster-liveness loop.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: TLogConfig, stores: P, cluster: watch::Receiver<ClusterInfo>) -> Arc<Self> {
        let peek_memory = config.peek_memory_bytes;
        let server = Arc::new(Self {
            instance_id: rand::rng().random(),
            config: Arc::new(config),
            stores,
            peek_limiter: Arc::new(Semaphore::new(peek_memory)),
            inner: Mutex::new(ServerInner {
                groups: HashMap::new(),
                team_routes: HashMap::new(),
                recruitments: HashMap::new(),
                current_epoch: Epoch(0),
                current_log_ids: Vec::new(),
                peek_cursors: HashMap::new(),
            }),
            cluster,
            removed: watch::channel(false).0,
            recovery_finished: AtomicBool::new(false),
        });
        tokio::spawn(server.clone().run_cluster_watch());
        server
    }

    pub fn is_removed(&self) -> bool {
        *self.removed.borrow()
    }

    pub async fn when_removed(&self) {
        let mut rx = self.removed.subscribe();
        let _ = rx.wait_for(|removed| *removed).await;
    }

    /// Handle an `InitializeTLog` recruitment.
    ///
    /// Repeated requests with the same recruitment id receive the
    /// already-constructed interface. Any other failure rejects the
    /// recruitment.
    pub async fn tlog_start(self: &Arc<Self>, req: InitializeTLogRequest) -> Result<TLogInterface, TLogError> {
        if self.is_removed() {
            return Err(TLogError::WorkerRemoved);
        }
        if let Some(interface) = self.inner.lock().recruitments.get(&req.recruitment_id) {
            debug!("duplicate recruitment {}", req.recruitment_id);
            return Ok(interface.clone());
        }

        let recruitment_id = req.recruitment_id;
        match self.tlog_start_inner(req).await {
            Ok(interface) => {
                self.inner
                    .lock()
                    .recruitments
                    .insert(recruitment_id, interface.clone());
                Ok(interface)
            }
            Err(e @ TLogError::WorkerRemoved) => Err(e),
            Err(e) => Err(TLogError::RecruitmentFailed { reason: e.to_string() }),
        }
    }

    async fn tlog_start_inner(self: &Arc<Self>, req: InitializeTLogRequest) -> Result<TLogInterface, TLogError> {
        // Create or reopen each group's stores, recovering their durable
        // state, within the configured creation deadline.
        for recruit in &req.groups {
            if self.inner.lock().groups.contains_key(&recruit.group_id) {
                continue;
            }
            let open = async {
                let (kv, queue_store) = self.stores.open_group(recruit.group_id)?;
                GroupData::open(
                    recruit.group_id,
                    kv,
                    queue_store,
                    self.config.clone(),
                    self.peek_limiter.clone(),
                )
                .await
            };
            let group = tokio::time::timeout(self.config.tlog_max_create_duration, open)
                .await
                .map_err(|_| TLogError::IoTimeout(self.config.tlog_max_create_duration))??;

            tokio::spawn(group.clone().run_commit_queue());
            tokio::spawn(group.clone().run_spiller());
            self.inner.lock().groups.insert(recruit.group_id, group);
        }

        // A new recruitment displaces whatever was active before, in every
        // group this worker hosts.
        self.stop_all_tlogs();

        let mut new_log_ids = Vec::with_capacity(req.groups.len());
        for recruit in &req.groups {
            let group = self
                .inner
                .lock()
                .groups
                .get(&recruit.group_id)
                .cloned()
                .ok_or(TLogError::GroupNotFound(recruit.group_id))?;
            let log_id = LogId(rand::rng().random());
            group
                .recruit_generation(
                    log_id,
                    req.epoch,
                    req.spill_type,
                    req.locality,
                    req.txs_team,
                    recruit.teams.clone(),
                )
                .await?;
            new_log_ids.push(log_id);

            let mut inner = self.inner.lock();
            for team in &recruit.teams {
                inner.team_routes.insert(*team, recruit.group_id);
            }
            if let Some(txs) = req.txs_team {
                inner.team_routes.insert(txs, recruit.group_id);
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.current_epoch = req.epoch;
            inner.current_log_ids = new_log_ids;
        }

        let (tx, rx) = mpsc::channel(64);
        let interface = TLogInterface::new(self.instance_id, req.transfer_model, tx);
        tokio::spawn(self.clone().run_interface(rx));
        info!(
            "recruited tlog worker {:x} at epoch {} with {} group(s)",
            self.instance_id,
            req.epoch,
            req.groups.len()
        );
        Ok(interface)
    }

    /// Mark the prior active generation stopped in each group.
    pub fn stop_all_tlogs(&self) {
        let groups: Vec<_> = self.inner.lock().groups.values().cloned().collect();
        for group in groups {
            group.stop_active();
        }
    }

    /// Drive one recruited interface's request stream.
    ///
    /// Each request is dispatched on its own task so a commit waiting on
    /// durability never blocks a peek.
    async fn run_interface(self: Arc<Self>, mut rx: mpsc::Receiver<TLogRequest>) {
        while let Some(req) = rx.recv().await {
            let server = self.clone();
            tokio::spawn(async move { server.dispatch(req).await });
        }
    }

    async fn dispatch(self: Arc<Self>, req: TLogRequest) {
        match req {
            TLogRequest::Commit(req, reply) => {
                let res = self.handle_commit(req).await;
                let _ = reply.send(res);
            }
            TLogRequest::Peek(req, reply) => {
                if let Some(res) = self.handle_peek(req).await {
                    let _ = reply.send(res);
                }
                // An out-of-order peek is dropped without a reply.
            }
            TLogRequest::Pop(req, reply) => {
                let res = self.handle_pop(req).await;
                let _ = reply.send(res);
            }
            TLogRequest::Lock(req, reply) => {
                let res = match self.group(req.group) {
                    Ok(group) => group.lock_group().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(res);
            }
            TLogRequest::QueuingMetrics(req, reply) => {
                let res = self
                    .group(req.group)
                    .and_then(|group| group.queuing_metrics(self.instance_id));
                let _ = reply.send(res);
            }
            TLogRequest::ConfirmRunning(reply) => {
                let _ = reply.send(if self.is_removed() {
                    Err(TLogError::WorkerRemoved)
                } else {
                    Ok(())
                });
            }
            TLogRequest::WaitFailure(reply) => {
                self.when_removed().await;
                let _ = reply.send(Ok(()));
            }
            TLogRequest::RecoveryFinished(reply) => {
                self.recovery_finished.store(true, Relaxed);
                info!("tlog worker {:x}: recovery finished", self.instance_id);
                let _ = reply.send(Ok(()));
            }
            TLogRequest::Snap(req, reply) => {
                let groups: Vec<_> = self.inner.lock().groups.values().cloned().collect();
                let mut res = Ok(());
                for group in groups {
                    if let Err(e) = group.snapshot(req.snap_id).await {
                        res = Err(e);
                        break;
                    }
                }
                let _ = reply.send(res);
            }
            TLogRequest::DisablePop(req, reply) => {
                let groups: Vec<_> = self.inner.lock().groups.values().cloned().collect();
                for group in &groups {
                    group.disable_pop(req.snap_id);
                }
                let _ = reply.send(Ok(()));
            }
            TLogRequest::EnablePop(req, reply) => {
                let groups: Vec<_> = self.inner.lock().groups.values().cloned().collect();
                let mut res = Ok(());
                for group in &groups {
                    if let Err(e) = group.enable_pop(req.snap_id) {
                        res = Err(e);
                        break;
                    }
                }
                let _ = reply.send(res);
            }
        }
    }

    fn group(&self, group_id: TLogGroupId) -> Result<Arc<GroupData<P::Queue>>, TLogError> {
        self.inner
            .lock()
            .groups
            .get(&group_id)
            .cloned()
            .ok_or(TLogError::GroupNotFound(group_id))
    }

    fn group_for_team(&self, team: StorageTeamId) -> Result<Arc<GroupData<P::Queue>>, TLogError> {
        let inner = self.inner.lock();
        inner
            .team_routes
            .get(&team)
            .and_then(|group_id| inner.groups.get(group_id))
            .cloned()
            .ok_or(TLogError::TeamNotFound(team))
    }

    async fn handle_commit(&self, req: TLogCommitRequest) -> Result<TLogCommitReply, TLogError> {
        self.group_for_team(req.storage_team)?.commit(req).await
    }

    /// `None` means the request was dropped for arriving out of order.
    async fn handle_peek(&self, req: TLogPeekRequest) -> Option<Result<TLogPeekReply, TLogError>> {
        if let Some(cursor) = req.cursor {
            let mut inner = self.inner.lock();
            let expected = inner
                .peek_cursors
                .entry((cursor.client_id, req.storage_team))
                .or_insert(0);
            if cursor.sequence < *expected {
                warn!(
                    "dropping out-of-order peek from client {:x}: sequence {} < {}",
                    cursor.client_id, cursor.sequence, *expected
                );
                return None;
            }
            *expected = cursor.sequence + 1;
        }
        let group = match self.group_for_team(req.storage_team) {
            Ok(group) => group,
            Err(e) => return Some(Err(e)),
        };
        Some(group.peek(req).await)
    }

    async fn handle_pop(&self, req: TLogPopRequest) -> Result<(), TLogError> {
        self.group_for_team(req.storage_team)?.pop(req).await
    }

    /// The cluster-liveness loop.
    ///
    /// When this worker's generations vanish from the observed log system
    /// config and the cluster has recovered past our epoch (or reached full
    /// recovery at it), the worker is removed: every generation is stopped
    /// and its durable keys cleared.
    async fn run_cluster_watch(self: Arc<Self>) {
        let mut cluster = self.cluster.clone();
        loop {
            if cluster.changed().await.is_err() {
                return;
            }
            let info = cluster.borrow_and_update().clone();
            let (epoch, log_ids) = {
                let inner = self.inner.lock();
                (inner.current_epoch, inner.current_log_ids.clone())
            };
            if log_ids.is_empty() {
                continue;
            }
            let present = log_ids.iter().any(|id| info.live_log_ids.contains(id));
            let displaced = info.recovery_count > epoch || (info.recovery_count == epoch && info.fully_recovered);
            if !present && displaced {
                info!(
                    "tlog worker {:x} removed: epoch {} displaced by {}",
                    self.instance_id, epoch, info.recovery_count
                );
                self.remove_worker();
                return;
            }
        }
    }

    fn remove_worker(&self) {
        let groups: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.team_routes.clear();
            inner.current_log_ids.clear();
            inner.recruitments.clear();
            inner.groups.drain().map(|(_, g)| g).collect()
        };
        for group in groups {
            group.remove_for_displacement();
        }
        let _ = self.removed.send_replace(true);
    }
}
