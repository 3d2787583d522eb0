use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools as _;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use partlog_diskqueue::{FramedQueue, Location, Options as QueueOptions, QueueStore};
use partlog_kvstore::{keys, KeyValueStore};
use partlog_primitives::buf::{BufReader as _, BufWriter as _};
use partlog_primitives::{Epoch, LogId, SpillType, StorageTeamId, TLogGroupId, Tag, Version};
use rand::Rng as _;
use tokio::sync::{watch, Notify, Semaphore};

use crate::{
    config::TLogConfig,
    error::TLogError,
    generation::GenerationData,
    messages::{
        pack_messages, TLogCommitReply, TLogCommitRequest, TLogLockResult, TLogPeekReply, TLogPeekRequest,
        TLogPopRequest, TLogQueuingMetricsReply,
    },
    queue_entry::QueueEntry,
};

const PROTOCOL_VERSION: u64 = 1;

/// A spilled-by-reference record: where in the disk queue the entry's frame
/// lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SpillRecord {
    start: Location,
    end: Location,
    length: u32,
}

impl SpillRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20);
        out.put_u64(self.start.0);
        out.put_u64(self.end.0);
        out.put_u32(self.length);
        out
    }

    fn decode(mut bytes: &[u8]) -> Result<Self, TLogError> {
        let start = Location(bytes.get_u64().map_err(TLogError::CorruptEntry)?);
        let end = Location(bytes.get_u64().map_err(TLogError::CorruptEntry)?);
        let length = bytes.get_u32().map_err(TLogError::CorruptEntry)?;
        Ok(Self { start, end, length })
    }
}

fn version_value(v: Version) -> [u8; 8] {
    v.0.to_le_bytes()
}

fn parse_u64_value(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

fn parse_version_value(bytes: &[u8]) -> Version {
    Version(parse_u64_value(bytes))
}

struct GroupInner {
    generations: HashMap<LogId, Arc<GenerationData>>,
    /// Oldest first; pops drain from the front.
    pop_order: VecDeque<LogId>,
    /// Oldest first; the spiller works the front.
    spill_order: VecDeque<LogId>,
    /// The single non-stopped generation, if any.
    active: Option<LogId>,
    /// Pops deferred while `ignore_pop` is set; replayed on enable.
    to_be_popped: HashMap<StorageTeamId, TLogPopRequest>,
    ignore_pop: bool,
    snap_owner: Option<u128>,
}

/// A TLog group: current and prior generations over one disk queue and one
/// key/value store.
pub struct GroupData<S: QueueStore> {
    pub group_id: TLogGroupId,
    config: Arc<TLogConfig>,
    kv: Arc<dyn KeyValueStore>,
    queue: Mutex<FramedQueue<S>>,
    /// Serializes key/value commits.
    persistent_data_commit_lock: tokio::sync::Mutex<()>,
    inner: Mutex<GroupInner>,

    /// Fired when a generation is recruited into this group.
    pub(crate) new_log_data: Notify,
    /// Fired when pending queue bytes demand an immediate commit.
    force_commit: Notify,
    spill_notify: Notify,
    pending_queue_bytes: AtomicU64,
    large_queue_commit: AtomicBool,
    peek_limiter: Arc<Semaphore>,
    closed: watch::Sender<bool>,
}

impl<S: QueueStore> GroupData<S> {
    /// Open (or create) the group's stores and recover durable state.
    ///
    /// A fresh store is stamped with the format marker and must start with
    /// an empty queue. An existing store replays the disk queue from the
    /// saved recovery location, rebuilding every persisted generation in a
    /// stopped state.
    pub async fn open(
        group_id: TLogGroupId,
        kv: Arc<dyn KeyValueStore>,
        store: S,
        config: Arc<TLogConfig>,
        peek_limiter: Arc<Semaphore>,
    ) -> Result<Arc<Self>, TLogError> {
        let fresh = match kv.read_value(keys::FORMAT)? {
            None => {
                kv.set(keys::FORMAT, keys::FORMAT_VALUE);
                kv.commit().await?;
                true
            }
            Some(v) if v == keys::FORMAT_VALUE => false,
            Some(other) => {
                return Err(TLogError::UnsupportedFormat(
                    String::from_utf8_lossy(&other).into_owned(),
                ))
            }
        };

        let recover_at = kv
            .read_value(keys::RECOVERY_LOCATION)?
            .map(|v| Location(parse_u64_value(&v)))
            .unwrap_or(Location::ZERO);
        let queue_opts = QueueOptions {
            max_file_bytes: config.disk_queue_file_bytes,
        };
        let mut queue = FramedQueue::open(store, queue_opts, recover_at)?;

        // Drain the replayed records up front; generations are built from
        // the durable metadata before entries are routed to them.
        let mut frames = Vec::new();
        while let Some(frame) = queue.read_next() {
            let entry = QueueEntry::decode(&mut frame.payload.as_slice()).map_err(TLogError::CorruptEntry)?;
            frames.push((frame.start, frame.end, entry));
        }
        if fresh && !frames.is_empty() {
            return Err(TLogError::UnsupportedFormat(
                "fresh store with a non-empty disk queue".into(),
            ));
        }

        let group = Arc::new(Self {
            group_id,
            config: config.clone(),
            kv,
            queue: Mutex::new(queue),
            persistent_data_commit_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(GroupInner {
                generations: HashMap::new(),
                pop_order: VecDeque::new(),
                spill_order: VecDeque::new(),
                active: None,
                to_be_popped: HashMap::new(),
                ignore_pop: false,
                snap_owner: None,
            }),
            new_log_data: Notify::new(),
            force_commit: Notify::new(),
            spill_notify: Notify::new(),
            pending_queue_bytes: AtomicU64::new(0),
            large_queue_commit: AtomicBool::new(false),
            peek_limiter,
            closed: watch::channel(false).0,
        });
        group.recover_generations(frames)?;

        Ok(group)
    }

    fn recover_generations(
        self: &Arc<Self>,
        frames: Vec<(Location, Location, QueueEntry)>,
    ) -> Result<(), TLogError> {
        // Persisted generations are keyed by their `version/<logId>` entry.
        let (begin, end) = keys::all_version_keys_range();
        let persisted = self.kv.read_range(&begin, &end, None)?;
        if persisted.is_empty() && frames.is_empty() {
            return Ok(());
        }

        let mut recovered: Vec<(Epoch, Arc<GenerationData>)> = Vec::new();
        for (key, value) in persisted {
            let Some(log_id) = keys::parse_version_key(&key) else {
                warn!("skipping malformed version key {key:?}");
                continue;
            };
            let persistent_version = parse_version_value(&value);
            let kcv = self
                .kv
                .read_value(&keys::known_committed(log_id))?
                .map(|v| parse_version_value(&v))
                .unwrap_or_default();
            let epoch = Epoch(
                self.kv
                    .read_value(&keys::db_recovery_count(log_id))?
                    .map(|v| parse_u64_value(&v))
                    .unwrap_or_default(),
            );
            let spill_type = self
                .kv
                .read_value(&keys::spill_type(log_id))?
                .and_then(|v| v.first().copied())
                .and_then(SpillType::from_u8)
                .unwrap_or_default();
            let locality = self
                .kv
                .read_value(&keys::locality(log_id))?
                .map(|v| parse_u64_value(&v) as i32)
                .unwrap_or_default();

            // Team membership is rebuilt from the popped markers plus the
            // queue entries routed below.
            let (pb, pe) = keys::tag_pop_range(log_id);
            let pops = self.kv.read_range(&pb, &pe, None)?;
            let mut teams = Vec::new();
            for (pk, _) in &pops {
                if let Some(tag) = keys::parse_tag_pop_key(pk) {
                    teams.push(StorageTeamId(tag.0));
                }
            }
            for (_, _, entry) in frames.iter().filter(|(_, _, e)| e.id == log_id) {
                teams.push(entry.storage_team);
            }

            let gen = GenerationData::new(
                log_id,
                self.group_id,
                epoch,
                spill_type,
                locality,
                None,
                teams,
                self.config.clone(),
            );
            gen.version.set(persistent_version);
            gen.update_known_committed(kcv);
            {
                let mut state = gen.state.lock();
                state.persistent_version = persistent_version;
                state.initialized = true;
            }
            for (pk, pv) in pops {
                if let Some(tag) = keys::parse_tag_pop_key(&pk) {
                    gen.pop_team(StorageTeamId(tag.0), parse_version_value(&pv));
                }
            }
            // A recovered generation belongs to a prior epoch: stopped.
            gen.stop();
            recovered.push((epoch, gen));
        }
        recovered.sort_by_key(|(epoch, gen)| (*epoch, gen.log_id));

        let mut inner = self.inner.lock();
        for (_, gen) in &recovered {
            inner.generations.insert(gen.log_id, gen.clone());
            inner.pop_order.push_back(gen.log_id);
            inner.spill_order.push_back(gen.log_id);
        }
        drop(inner);

        // Route the replayed queue entries.
        let mut replayed = 0usize;
        for (start, end, entry) in frames {
            let Some(gen) = self.generation(entry.id) else {
                warn!("queue entry for unknown generation {} ignored", entry.id);
                continue;
            };
            if entry.version > gen.persistent_version() && entry.version > gen.team_popped(entry.storage_team) {
                gen.commit_messages(entry.version, entry.storage_team, &entry.messages)?;
                replayed += 1;
            }
            gen.record_version_location(entry.version, start, end);
            gen.update_known_committed(entry.known_committed_version);
            gen.version.set(entry.version);
        }
        // Everything replayed was read back from the queue, so it is
        // durable by definition.
        for (_, gen) in &recovered {
            gen.queue_committed_version.set(gen.version.get());
            gen.set_durable_known_committed(gen.known_committed_version());
        }

        info!(
            "group {}: recovered {} generation(s), {} queue entries re-indexed",
            self.group_id,
            recovered.len(),
            replayed
        );
        Ok(())
    }

    pub fn generation(&self, log_id: LogId) -> Option<Arc<GenerationData>> {
        self.inner.lock().generations.get(&log_id).cloned()
    }

    pub fn active_generation(&self) -> Option<Arc<GenerationData>> {
        let inner = self.inner.lock();
        inner.active.and_then(|id| inner.generations.get(&id).cloned())
    }

    /// Stop the currently active generation, if any.
    pub fn stop_active(&self) {
        let gen = {
            let mut inner = self.inner.lock();
            inner.active.take().and_then(|id| inner.generations.get(&id).cloned())
        };
        if let Some(gen) = gen {
            gen.stop();
        }
    }

    /// Allocate and persist a new generation, making it the append target.
    ///
    /// The caller must have stopped the previous generation first (see
    /// [`Self::stop_active`]).
    pub async fn recruit_generation(
        self: &Arc<Self>,
        log_id: LogId,
        epoch: Epoch,
        spill_type: SpillType,
        locality: i32,
        txs_team: Option<StorageTeamId>,
        teams: Vec<StorageTeamId>,
    ) -> Result<Arc<GenerationData>, TLogError> {
        let gen = GenerationData::new(
            log_id,
            self.group_id,
            epoch,
            spill_type,
            locality,
            txs_team,
            teams,
            self.config.clone(),
        );

        self.kv.set(&keys::protocol_version(log_id), &PROTOCOL_VERSION.to_le_bytes());
        self.kv.set(&keys::spill_type(log_id), &[spill_type.as_u8()]);
        self.kv.set(&keys::db_recovery_count(log_id), &epoch.0.to_le_bytes());
        self.kv.set(&keys::version(log_id), &version_value(Version::ZERO));
        self.kv.set(&keys::known_committed(log_id), &version_value(Version::ZERO));
        self.kv.set(&keys::locality(log_id), &(locality as u64).to_le_bytes());
        {
            let _commit = self.persistent_data_commit_lock.lock().await;
            self.kv.commit().await?;
        }
        gen.set_initialized();

        {
            let mut inner = self.inner.lock();
            inner.generations.insert(log_id, gen.clone());
            inner.pop_order.push_back(log_id);
            inner.spill_order.push_back(log_id);
            inner.active = Some(log_id);
        }
        self.new_log_data.notify_waiters();
        info!(
            "group {}: recruited generation {log_id} at epoch {epoch}",
            self.group_id
        );
        Ok(gen)
    }

    /// The commit handler.
    ///
    /// Serializes on the `prev_version -> version` chain of the active
    /// generation, appends to the team index and the framed queue, releases
    /// the version, and replies once the queue commit reaches it (or the
    /// generation stops).
    pub async fn commit(self: &Arc<Self>, req: TLogCommitRequest) -> Result<TLogCommitReply, TLogError> {
        let gen = self.active_generation().ok_or(TLogError::TLogStopped)?;
        if !gen.team_set.contains(&req.storage_team) {
            return Err(TLogError::TeamNotFound(req.storage_team));
        }
        gen.update_min_known_committed(req.min_known_committed_version);

        tokio::select! {
            biased;
            _ = gen.when_stopped() => return Err(TLogError::TLogStopped),
            _ = gen.version.when_at_least(req.prev_version) => {}
        }

        // Backpressure: stall with jitter while over the hard memory limit.
        while gen.memory_pressure() >= self.config.hard_limit_bytes {
            if gen.is_stopped() {
                return Err(TLogError::TLogStopped);
            }
            self.spill_notify.notify_one();
            let jitter = Duration::from_micros(rand::rng().random_range(2_500..7_500));
            tokio::time::sleep(jitter).await;
        }

        // A request whose prev_version no longer matches was already
        // processed: return the current durable state without re-appending.
        if gen.version.get() != req.prev_version {
            debug!(
                "duplicate commit for team {} at version {} (log at {})",
                req.storage_team,
                req.version,
                gen.version.get()
            );
            return Ok(TLogCommitReply {
                durable_known_committed_version: gen.durable_known_committed_version(),
            });
        }

        if req.messages.is_empty() {
            // Nothing to log: accepted, but the version does not advance and
            // no queue entry is produced.
            return Ok(TLogCommitReply {
                durable_known_committed_version: gen.durable_known_committed_version(),
            });
        }

        gen.commit_messages(req.version, req.storage_team, &req.messages)?;
        gen.update_known_committed(req.known_committed_version);

        if self.config.durable_queue_commit {
            let entry = QueueEntry {
                id: gen.log_id,
                storage_team: req.storage_team,
                version: req.version,
                known_committed_version: gen.known_committed_version(),
                messages: req.messages,
            };
            let payload = entry.encode();
            let (start, end) = self.queue.lock().push(&payload)?;
            gen.record_version_location(req.version, start, end);

            let pending = self.pending_queue_bytes.fetch_add(payload.len() as u64, Relaxed) + payload.len() as u64;
            if pending > self.config.max_queue_commit_bytes {
                self.large_queue_commit.store(true, Relaxed);
                self.force_commit.notify_waiters();
            }
        }

        // The release: peek waiters and the commit-queue loop observe this.
        gen.version.set(req.version);

        if gen.memory_pressure() > self.config.spill_threshold_bytes {
            self.spill_notify.notify_one();
        }

        let queue_commit = async {
            let mut warned = false;
            loop {
                let wait = gen.queue_committed_version.when_at_least(req.version);
                match tokio::time::timeout(self.config.warning_timeout, wait).await {
                    Ok(()) => break,
                    Err(_) => {
                        if !warned {
                            warn!(
                                "slow tlog commit: version {} waiting on queue (debug_id={:?})",
                                req.version, req.debug_id
                            );
                            warned = true;
                        }
                    }
                }
            }
        };
        tokio::select! {
            biased;
            _ = gen.when_stopped() => return Err(TLogError::TLogStopped),
            _ = queue_commit => {}
        }

        Ok(TLogCommitReply {
            durable_known_committed_version: gen.durable_known_committed_version(),
        })
    }

    /// The commit-queue actor: one per group.
    ///
    /// Follows the single active generation, making pushed queue bytes
    /// durable and advancing `queue_committed_version` /
    /// `durable_known_committed_version`. A stopped predecessor with
    /// unflushed bytes has its final commit forced once the trailing fsync
    /// lands.
    pub async fn run_commit_queue(self: Arc<Self>) {
        loop {
            let Some(gen) = self.active_generation() else {
                tokio::select! {
                    _ = self.new_log_data.notified() => continue,
                    _ = self.when_closed() => return,
                }
            };
            debug!("group {}: commit queue serving generation {}", self.group_id, gen.log_id);

            loop {
                let committed = gen.queue_committed_version.get();
                tokio::select! {
                    _ = gen.version.when_greater(committed) => {}
                    _ = self.force_commit.notified() => {}
                    _ = gen.when_stopped() => {}
                    _ = self.when_closed() => return,
                }

                let commit_to = gen.version.get();
                let kcv = gen.known_committed_version();
                if commit_to > committed {
                    let pending = self.pending_queue_bytes.swap(0, Relaxed);
                    if self.large_queue_commit.swap(false, Relaxed) {
                        debug!(
                            "group {}: forced queue commit of {pending} pending bytes",
                            self.group_id
                        );
                    }
                    if let Err(e) = self.commit_queue_now() {
                        self.terminate(e);
                        return;
                    }
                    gen.queue_committed_version.set(commit_to);
                    gen.set_durable_known_committed(kcv);
                }

                if gen.memory_pressure() > self.config.spill_threshold_bytes {
                    self.spill_notify.notify_one();
                }

                if gen.is_stopped() && gen.queue_committed_version.get() >= gen.version.get() {
                    break;
                }
            }

            if let Err(e) = self.finish_stopped_generations() {
                self.terminate(e);
                return;
            }
        }
    }

    fn commit_queue_now(&self) -> Result<(), TLogError> {
        if !self.config.durable_queue_commit {
            return Ok(());
        }
        self.queue.lock().commit()?;
        Ok(())
    }

    /// Force `queue_committed_version` of stopped generations to their end.
    ///
    /// Sound because the preceding queue commit covered every byte they
    /// pushed.
    fn finish_stopped_generations(&self) -> Result<(), TLogError> {
        self.commit_queue_now()?;
        let gens: Vec<_> = {
            let inner = self.inner.lock();
            inner.generations.values().cloned().collect()
        };
        for gen in gens {
            if gen.is_stopped() && gen.queue_committed_version.get() < gen.version.get() {
                debug!(
                    "group {}: forcing final commit of stopped generation {}",
                    self.group_id, gen.log_id
                );
                gen.queue_committed_version.set(gen.version.get());
                gen.set_durable_known_committed(gen.known_committed_version());
            }
        }
        Ok(())
    }

    /// The generation that serves peeks for `team` from `begin` onwards:
    /// the oldest one still holding relevant data, falling back to the
    /// active generation.
    fn serving_generation(&self, team: StorageTeamId, begin: Version) -> Option<Arc<GenerationData>> {
        let inner = self.inner.lock();
        for id in &inner.pop_order {
            let Some(gen) = inner.generations.get(id) else { continue };
            if !gen.team_set.contains(&team) {
                continue;
            }
            if !gen.is_stopped() || gen.version.get() >= begin {
                return Some(gen.clone());
            }
        }
        inner
            .active
            .and_then(|id| inner.generations.get(&id).cloned())
            .filter(|gen| gen.team_set.contains(&team))
    }

    /// The peek handler: spilled records first, then the in-memory index.
    pub async fn peek(self: &Arc<Self>, req: TLogPeekRequest) -> Result<TLogPeekReply, TLogError> {
        let gen = self
            .serving_generation(req.storage_team, req.begin_version)
            .ok_or(TLogError::TeamNotFound(req.storage_team))?;

        if gen.version.get() < req.begin_version {
            if req.return_if_blocked {
                return Ok(TLogPeekReply {
                    data: Vec::new(),
                    end: req.begin_version,
                    popped: None,
                    max_known_version: gen.version.get(),
                    min_known_committed_version: gen.min_known_committed_version(),
                    begin: None,
                    only_spilled: false,
                });
            }
            tokio::select! {
                _ = gen.version.when_at_least(req.begin_version) => {}
                // A stopped generation will never reach `begin`; serve
                // whatever exists.
                _ = gen.when_stopped() => {}
            }
        }

        // Bound total in-flight peek bytes across the process.
        let budget = self.config.peek_reply_bytes.min(self.config.peek_memory_bytes);
        let _permit = self
            .peek_limiter
            .acquire_many(budget as u32)
            .await
            .map_err(|_| TLogError::OperationCancelled)?;

        let popped = gen.team_popped(req.storage_team);
        let mut begin = req.begin_version;
        let mut begin_adjusted = None;
        let mut popped_field = None;
        if begin <= popped && popped > Version::ZERO {
            popped_field = Some(popped);
            begin = popped.next();
            begin_adjusted = Some(begin);
        }
        let end_limit = req
            .end_version
            .unwrap_or(Version(u64::MAX))
            .min(gen.version.get());

        let mut entries: Vec<(Version, Vec<u8>)> = Vec::new();
        let mut used = 0usize;
        let mut only_spilled = false;

        let persistent = gen.persistent_version();
        if begin <= persistent {
            let spill_end = persistent.min(end_limit);
            let truncated =
                self.read_spilled(&gen, req.storage_team, begin, spill_end, budget, &mut entries, &mut used)?;
            only_spilled = truncated;
        }

        if !req.only_spilled && !only_spilled {
            let mem_begin = Version(begin.0.max(persistent.0 + 1));
            for (version, data) in gen.peek_in_memory(req.storage_team, mem_begin, end_limit) {
                if used + data.len() > budget && !entries.is_empty() {
                    break;
                }
                used += data.len();
                entries.push((version, data.to_vec()));
            }
        }

        let end = entries.last().map(|(v, _)| *v).unwrap_or(begin);
        Ok(TLogPeekReply {
            data: pack_messages(entries.iter().map(|(v, b)| (*v, b.as_slice()))),
            end,
            popped: popped_field,
            max_known_version: gen.version.get(),
            min_known_committed_version: gen.min_known_committed_version(),
            begin: begin_adjusted,
            only_spilled,
        })
    }

    /// Read spilled records for `[begin, end]` into `entries`, respecting
    /// the byte budget. Returns whether the scan stopped early (more
    /// spilled data remains).
    #[allow(clippy::too_many_arguments)]
    fn read_spilled(
        &self,
        gen: &GenerationData,
        team: StorageTeamId,
        begin: Version,
        end: Version,
        budget: usize,
        entries: &mut Vec<(Version, Vec<u8>)>,
        used: &mut usize,
    ) -> Result<bool, TLogError> {
        if end < begin {
            return Ok(false);
        }
        let tag = Tag::from(team);
        let read_limit = self.config.concurrent_log_router_reads.max(1) * 64;

        if gen.spills_by_reference(team) {
            let (kb, ke) = keys::tag_msg_ref_range(gen.log_id, tag, begin, Version(end.0 + 1));
            let records = self.kv.read_range(&kb, &ke, Some(read_limit + 1))?;
            let truncated = records.len() > read_limit;
            for (key, value) in records.into_iter().take(read_limit) {
                let Some(version) = keys::parse_versioned_key(&key) else {
                    warn!("malformed spill record key {key:?}");
                    continue;
                };
                let record = SpillRecord::decode(&value)?;
                let frame = self.queue.lock().read_frame_at(record.start)?;
                let entry = QueueEntry::decode(&mut frame.as_slice()).map_err(TLogError::CorruptEntry)?;
                if *used + entry.messages.len() > budget && !entries.is_empty() {
                    return Ok(true);
                }
                *used += entry.messages.len();
                entries.push((version, entry.messages));
            }
            Ok(truncated)
        } else {
            let (kb, ke) = keys::tag_msg_range(gen.log_id, tag, begin, Version(end.0 + 1));
            let records = self.kv.read_range(&kb, &ke, Some(read_limit + 1))?;
            let truncated = records.len() > read_limit;
            for (key, value) in records.into_iter().take(read_limit) {
                let Some(version) = keys::parse_versioned_key(&key) else {
                    warn!("malformed spill key {key:?}");
                    continue;
                };
                if *used + value.len() > budget && !entries.is_empty() {
                    return Ok(true);
                }
                *used += value.len();
                entries.push((version, value));
            }
            Ok(truncated)
        }
    }

    /// The pop handler.
    ///
    /// Advances the popped-through marker of `(team, tag)` in every
    /// generation holding the team, reclaims memory and spill records, and
    /// lets the disk queue advance behind the oldest generation still in
    /// pop order.
    pub async fn pop(self: &Arc<Self>, req: TLogPopRequest) -> Result<(), TLogError> {
        {
            let mut inner = self.inner.lock();
            if inner.ignore_pop {
                let slot = inner.to_be_popped.entry(req.storage_team).or_insert(req);
                if req.version > slot.version {
                    *slot = req;
                }
                return Ok(());
            }
        }
        self.apply_pop(req)
    }

    fn apply_pop(self: &Arc<Self>, req: TLogPopRequest) -> Result<(), TLogError> {
        let gens: Vec<_> = {
            let inner = self.inner.lock();
            inner
                .pop_order
                .iter()
                .filter_map(|id| inner.generations.get(id).cloned())
                .filter(|g| g.team_set.contains(&req.storage_team))
                .collect()
        };
        if gens.is_empty() {
            // Late pop for an already-removed generation: nothing to do.
            debug!("pop for unknown team {} ignored", req.storage_team);
            return Ok(());
        }

        for gen in gens {
            let new_popped = gen.pop_team(req.storage_team, req.version);
            // Durable after the next key/value commit.
            self.kv
                .set(&keys::tag_pop(gen.log_id, req.tag), &version_value(new_popped));
            // Spill records up to the popped version are no longer needed.
            let (cb, ce) = keys::tag_msg_range(gen.log_id, req.tag, Version::ZERO, new_popped.next());
            self.kv.clear_range(&cb, &ce);
            let (cb, ce) = keys::tag_msg_ref_range(gen.log_id, req.tag, Version::ZERO, new_popped.next());
            self.kv.clear_range(&cb, &ce);

            if gen.spills_by_reference(req.storage_team) {
                self.refresh_ref_spill_floor(&gen, req.storage_team, new_popped)?;
            }
        }

        self.update_queue_pop();
        Ok(())
    }

    /// Recompute a team's reference-spill pin from the records that remain
    /// visible in the store. Staged clears are not yet visible, which only
    /// makes the pin conservative.
    fn refresh_ref_spill_floor(
        &self,
        gen: &GenerationData,
        team: StorageTeamId,
        popped: Version,
    ) -> Result<(), TLogError> {
        let tag = Tag::from(team);
        let (kb, ke) = keys::tag_msg_ref_range(gen.log_id, tag, popped.next(), Version(u64::MAX));
        let first = self.kv.read_range(&kb, &ke, Some(1))?;
        let floor = first.first().and_then(|(k, _)| keys::parse_versioned_key(k));
        let mut state = gen.state.lock();
        if let Some(t) = state.teams.get_mut(&team) {
            t.set_ref_spill_floor(floor);
        }
        Ok(())
    }

    /// Advance the disk queue's reclamation frontier.
    ///
    /// The queue pops only up to the minimum pinned location across the
    /// oldest generation still in pop order; popping a newer generation
    /// alone does not advance it. Generations that are drained and fully
    /// popped leave pop order and have their keys cleared.
    pub fn update_queue_pop(self: &Arc<Self>) {
        let mut removed = Vec::new();
        let pop_to = {
            let mut inner = self.inner.lock();
            while let Some(front) = inner.pop_order.front().copied() {
                let Some(gen) = inner.generations.get(&front).cloned() else {
                    inner.pop_order.pop_front();
                    continue;
                };
                if gen.is_drained() && gen.fully_popped() && inner.active != Some(front) {
                    debug!("group {}: generation {front} drained and popped, removing", self.group_id);
                    inner.pop_order.pop_front();
                    inner.spill_order.retain(|id| *id != front);
                    inner.generations.remove(&front);
                    removed.push(front);
                    continue;
                }
                break;
            }

            let pins: Vec<_> = inner
                .pop_order
                .iter()
                .filter_map(|id| inner.generations.get(id))
                .filter_map(|gen| {
                    gen.prune_version_locations();
                    gen.first_pinned_location()
                })
                .collect();
            pins.into_iter().min()
        };

        for log_id in removed {
            for (cb, ce) in keys::all_ranges_for_log(log_id) {
                self.kv.clear_range(&cb, &ce);
            }
        }

        let mut queue = self.queue.lock();
        // No generation pins the queue: everything durable was consumed.
        let loc = pop_to.unwrap_or(queue.durable_location());
        queue.pop(loc);
        let popped = queue.popped_location();
        drop(queue);
        // Replay restarts here; staged alongside the pops, committed with
        // the next key/value commit.
        self.kv
            .set(keys::RECOVERY_LOCATION, &version_value(Version(popped.0)));
    }

    /// The spiller actor: one per group.
    ///
    /// When the group's memory pressure exceeds the spill threshold, moves
    /// the oldest generation's in-memory entries into the key/value store,
    /// oldest generation first.
    pub async fn run_spiller(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.spill_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = self.when_closed() => return,
            }
            while self.memory_pressure_total() > self.config.spill_threshold_bytes {
                let Some(gen) = self.oldest_with_memory() else { break };
                match self.spill_generation(&gen).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        self.terminate(e);
                        return;
                    }
                }
            }
        }
    }

    pub fn memory_pressure_total(&self) -> u64 {
        let inner = self.inner.lock();
        inner.generations.values().map(|g| g.memory_pressure()).sum()
    }

    fn oldest_with_memory(&self) -> Option<Arc<GenerationData>> {
        let inner = self.inner.lock();
        inner
            .spill_order
            .iter()
            .filter_map(|id| inner.generations.get(id))
            .find(|gen| {
                let state = gen.state.lock();
                state.teams.values().any(|t| t.bytes_in_memory() > 0)
            })
            .cloned()
    }

    /// Spill one generation's queue-durable in-memory entries.
    ///
    /// Entries stay readable in memory until the key/value commit lands;
    /// only then are they dropped and `bytes_durable` advanced.
    pub async fn spill_generation(self: &Arc<Self>, gen: &Arc<GenerationData>) -> Result<bool, TLogError> {
        let spill_to = gen.queue_committed_version.get();
        if spill_to <= gen.persistent_version() {
            return Ok(false);
        }

        // Collect the batch without removing anything: peeks must not
        // observe a window where the data is neither in memory nor
        // committed to the store.
        struct TeamBatch {
            team: StorageTeamId,
            entries: Vec<(Version, bytes::Bytes, Option<(Location, Location)>)>,
        }
        let mut batches = Vec::new();
        {
            let state = gen.state.lock();
            let locations = &state.version_locations;
            // Deterministic staging order keeps store contents reproducible.
            for (team, data) in state.teams.iter().sorted_by_key(|(team, _)| **team) {
                let entries: Vec<_> = data
                    .entries_in(Version::ZERO, spill_to)
                    .map(|(v, b)| (*v, b.clone(), locations.get(v).copied()))
                    .collect();
                if !entries.is_empty() {
                    batches.push(TeamBatch { team: *team, entries });
                }
            }
        }
        if batches.is_empty() {
            // Still advance the persisted version so recovery skips ahead.
            self.kv.set(&keys::version(gen.log_id), &version_value(spill_to));
            let _commit = self.persistent_data_commit_lock.lock().await;
            self.kv.commit().await?;
            drop(_commit);
            gen.state.lock().persistent_version = spill_to;
            return Ok(false);
        }

        let mut spilled_bytes = 0u64;
        for batch in &batches {
            let tag = Tag::from(batch.team);
            let by_reference = gen.spills_by_reference(batch.team);
            for (version, data, location) in &batch.entries {
                spilled_bytes += data.len() as u64;
                match (by_reference, location) {
                    (true, Some((start, end))) => {
                        let record = SpillRecord {
                            start: *start,
                            end: *end,
                            length: data.len() as u32,
                        };
                        self.kv
                            .set(&keys::tag_msg_ref(gen.log_id, tag, *version), &record.encode());
                    }
                    // Without a recorded frame the bytes themselves are the
                    // only durable form we can offer.
                    _ => {
                        self.kv.set(&keys::tag_msg(gen.log_id, tag, *version), data);
                    }
                }
            }
        }
        self.kv.set(&keys::version(gen.log_id), &version_value(spill_to));
        self.kv.set(
            &keys::known_committed(gen.log_id),
            &version_value(gen.known_committed_version()),
        );

        {
            let _commit = self.persistent_data_commit_lock.lock().await;
            self.kv.commit().await?;
        }

        {
            let mut state = gen.state.lock();
            for batch in &batches {
                let by_reference = gen.spills_by_reference(batch.team);
                if let Some(team) = state.teams.get_mut(&batch.team) {
                    let taken = team.take_through(spill_to);
                    if by_reference {
                        if let Some((first, _)) = taken.first() {
                            team.note_ref_spilled(*first);
                        }
                    }
                }
            }
            state.bytes_durable += spilled_bytes;
            state.persistent_version = spill_to;
        }
        debug!(
            "group {}: spilled {} bytes of generation {} through version {}",
            self.group_id, spilled_bytes, gen.log_id, spill_to
        );
        Ok(true)
    }

    /// Stop the group's active generation and report its end state for
    /// recovery handoff.
    pub async fn lock_group(self: &Arc<Self>) -> Result<TLogLockResult, TLogError> {
        let gen = self.active_generation().ok_or(TLogError::TLogStopped)?;
        gen.stop();
        self.finish_stopped_generations()?;

        self.kv.set(&keys::version(gen.log_id), &version_value(gen.version.get()));
        self.kv.set(
            &keys::known_committed(gen.log_id),
            &version_value(gen.known_committed_version()),
        );
        {
            let _commit = self.persistent_data_commit_lock.lock().await;
            self.kv.commit().await?;
        }

        info!(
            "group {}: locked generation {} at version {}",
            self.group_id,
            gen.log_id,
            gen.version.get()
        );
        Ok(TLogLockResult {
            end: gen.version.get(),
            known_committed_version: gen.known_committed_version(),
        })
    }

    pub fn queuing_metrics(&self, instance_id: u64) -> Result<TLogQueuingMetricsReply, TLogError> {
        let (bytes_input, bytes_durable, v) = match self.active_generation() {
            Some(gen) => (gen.bytes_input(), gen.bytes_durable(), gen.version.get()),
            None => (0, 0, Version::ZERO),
        };
        let local_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Ok(TLogQueuingMetricsReply {
            local_time,
            instance_id,
            bytes_durable,
            bytes_input,
            storage_bytes: self.kv.storage_bytes()?,
            v,
        })
    }

    /// Defer pops for a snapshot. Pops received while disabled accumulate
    /// in `to_be_popped`.
    pub fn disable_pop(&self, snap_id: u128) {
        let mut inner = self.inner.lock();
        inner.ignore_pop = true;
        inner.snap_owner = Some(snap_id);
        info!("group {}: pops disabled for snapshot {snap_id:x}", self.group_id);
    }

    /// Re-enable pops and replay everything deferred while disabled.
    pub fn enable_pop(self: &Arc<Self>, snap_id: u128) -> Result<(), TLogError> {
        let deferred = {
            let mut inner = self.inner.lock();
            if inner.snap_owner.is_some_and(|owner| owner != snap_id) {
                warn!(
                    "group {}: enable_pop from {snap_id:x} while owned by {:?}",
                    self.group_id, inner.snap_owner
                );
            }
            inner.ignore_pop = false;
            inner.snap_owner = None;
            std::mem::take(&mut inner.to_be_popped)
        };
        for (_, req) in deferred {
            self.apply_pop(req)?;
        }
        Ok(())
    }

    /// Flush queue and store for an externally driven snapshot.
    pub async fn snapshot(self: &Arc<Self>, snap_id: u128) -> Result<(), TLogError> {
        self.commit_queue_now()?;
        {
            let _commit = self.persistent_data_commit_lock.lock().await;
            self.kv.commit().await?;
        }
        info!("group {}: snapshot {snap_id:x} flushed", self.group_id);
        Ok(())
    }

    /// Stop every generation and clear the group's durable keys: the worker
    /// was displaced by newer cluster information.
    pub fn remove_for_displacement(&self) {
        let mut inner = self.inner.lock();
        inner.active = None;
        for gen in inner.generations.values() {
            gen.stop();
            for (cb, ce) in keys::all_ranges_for_log(gen.log_id) {
                self.kv.clear_range(&cb, &ce);
            }
        }
        inner.generations.clear();
        inner.pop_order.clear();
        inner.spill_order.clear();
        drop(inner);
        self.close();
    }

    fn terminate(&self, e: TLogError) {
        error!("group {}: terminal error: {e}", self.group_id);
        let inner = self.inner.lock();
        for gen in inner.generations.values() {
            gen.stop();
        }
        drop(inner);
        self.close();
    }

    pub fn close(&self) {
        let _ = self.closed.send_replace(true);
    }

    pub async fn when_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// The disk queue's current reclamation frontier, exposed for tests and
    /// metrics.
    pub fn queue_popped_location(&self) -> Location {
        self.queue.lock().popped_location()
    }

    pub fn queue_push_location(&self) -> Location {
        self.queue.lock().push_location()
    }
}
