use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use partlog_diskqueue::Location;
use partlog_primitives::{Epoch, LogId, SpillType, StorageTeamId, TLogGroupId, Version};
use tokio::sync::watch;

use crate::{
    block::{MessageBlockArena, TeamData},
    config::TLogConfig,
    error::TLogError,
    notified::NotifiedVersion,
};

/// Mutable per-generation state, guarded by a mutex held only across
/// non-awaiting sections.
pub(crate) struct GenerationState {
    pub teams: HashMap<StorageTeamId, TeamData>,
    arena: MessageBlockArena,
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    pub durable_known_committed_version: Version,
    pub bytes_input: u64,
    pub bytes_durable: u64,
    /// Disk-queue frame per committed version, for spilled-by-reference
    /// records and pop-location computation. Pruned as pops advance.
    pub version_locations: BTreeMap<Version, (Location, Location)>,
    /// Spilled (persisted to the key/value store) through this version.
    pub persistent_version: Version,
    pub initialized: bool,
}

/// One log generation of one TLog group.
///
/// Created on recruitment (or rebuilt from durable state on recovery),
/// stopped when a newer generation displaces it, and removed once drained
/// and fully popped. The group looks generations up by [`LogId`];
/// generations hold no reference back to the group.
pub struct GenerationData {
    pub log_id: LogId,
    pub group_id: TLogGroupId,
    /// The epoch that recruited this generation.
    pub recovery_count: Epoch,
    pub spill_type: SpillType,
    pub locality: i32,
    pub txs_team: Option<StorageTeamId>,
    /// Teams assigned to this generation; commits for others are refused.
    pub team_set: HashSet<StorageTeamId>,

    /// The latest committed (appended and released) version.
    pub version: NotifiedVersion,
    /// The latest version whose disk-queue bytes are committed.
    pub queue_committed_version: NotifiedVersion,

    stopped: watch::Sender<bool>,
    pub(crate) state: Mutex<GenerationState>,
    config: Arc<TLogConfig>,
}

impl GenerationData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log_id: LogId,
        group_id: TLogGroupId,
        recovery_count: Epoch,
        spill_type: SpillType,
        locality: i32,
        txs_team: Option<StorageTeamId>,
        teams: impl IntoIterator<Item = StorageTeamId>,
        config: Arc<TLogConfig>,
    ) -> Arc<Self> {
        let mut team_set: HashSet<_> = teams.into_iter().collect();
        if let Some(txs) = txs_team {
            team_set.insert(txs);
        }
        let default_block_bytes = config.default_block_bytes;
        Arc::new(Self {
            log_id,
            group_id,
            recovery_count,
            spill_type,
            locality,
            txs_team,
            team_set,
            version: NotifiedVersion::new(Version::ZERO),
            queue_committed_version: NotifiedVersion::new(Version::ZERO),
            stopped: watch::channel(false).0,
            state: Mutex::new(GenerationState {
                teams: HashMap::new(),
                arena: MessageBlockArena::new(default_block_bytes),
                known_committed_version: Version::ZERO,
                min_known_committed_version: Version::ZERO,
                durable_known_committed_version: Version::ZERO,
                bytes_input: 0,
                bytes_durable: 0,
                version_locations: BTreeMap::new(),
                persistent_version: Version::ZERO,
                initialized: false,
            }),
            config,
        })
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Mark the generation stopped. Commits in flight observe this through
    /// [`Self::when_stopped`] and reply `tlog_stopped`.
    pub fn stop(&self) {
        if self.stopped.send_replace(true) {
            return;
        }
        debug!("generation {} stopped at version {}", self.log_id, self.version.get());
    }

    pub async fn when_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// `true` once no further queue commits will occur for this generation.
    pub fn is_drained(&self) -> bool {
        self.is_stopped() && self.queue_committed_version.get() >= self.version.get()
    }

    /// Whether `team` spills by reference (the txs team always spills by
    /// value).
    pub fn spills_by_reference(&self, team: StorageTeamId) -> bool {
        self.spill_type == SpillType::Reference && self.txs_team != Some(team)
    }

    /// Append `messages` to `team`'s in-memory index at `version`.
    ///
    /// The caller advances [`Self::version`] separately, after the entry has
    /// also been framed into the disk queue.
    pub fn commit_messages(
        &self,
        version: Version,
        team: StorageTeamId,
        messages: &[u8],
    ) -> Result<(), TLogError> {
        if messages.is_empty() {
            return Ok(());
        }
        if !self.team_set.contains(&team) {
            return Err(TLogError::TeamNotFound(team));
        }
        if messages.len() > self.config.max_message_size {
            warn!(
                "oversized message for team {team}: {} bytes exceeds {}",
                messages.len(),
                self.config.max_message_size
            );
        }

        let mut state = self.state.lock();
        let data = state.arena.append(messages);
        state
            .teams
            .entry(team)
            .or_insert_with(|| TeamData::new(team))
            .append(version, data);
        state.bytes_input += messages.len() as u64;
        Ok(())
    }

    pub fn record_version_location(&self, version: Version, start: Location, end: Location) {
        self.state.lock().version_locations.insert(version, (start, end));
    }

    pub fn bytes_input(&self) -> u64 {
        self.state.lock().bytes_input
    }

    pub fn bytes_durable(&self) -> u64 {
        self.state.lock().bytes_durable
    }

    /// `bytes_input - bytes_durable`, the quantity backpressure and spill
    /// decisions are made on.
    pub fn memory_pressure(&self) -> u64 {
        let state = self.state.lock();
        state.bytes_input - state.bytes_durable
    }

    pub fn known_committed_version(&self) -> Version {
        self.state.lock().known_committed_version
    }

    pub fn update_known_committed(&self, v: Version) {
        let mut state = self.state.lock();
        state.known_committed_version = state.known_committed_version.max(v);
    }

    pub fn min_known_committed_version(&self) -> Version {
        self.state.lock().min_known_committed_version
    }

    pub fn update_min_known_committed(&self, v: Version) {
        let mut state = self.state.lock();
        state.min_known_committed_version = state.min_known_committed_version.max(v);
    }

    pub fn durable_known_committed_version(&self) -> Version {
        self.state.lock().durable_known_committed_version
    }

    pub fn set_durable_known_committed(&self, v: Version) {
        let mut state = self.state.lock();
        state.durable_known_committed_version = state.durable_known_committed_version.max(v);
    }

    pub fn persistent_version(&self) -> Version {
        self.state.lock().persistent_version
    }

    pub fn initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn set_initialized(&self) {
        self.state.lock().initialized = true;
    }

    pub fn team_popped(&self, team: StorageTeamId) -> Version {
        self.state
            .lock()
            .teams
            .get(&team)
            .map(|t| t.popped())
            .unwrap_or_default()
    }

    /// In-memory entries of `team` within `[begin, end]`.
    pub fn peek_in_memory(&self, team: StorageTeamId, begin: Version, end: Version) -> Vec<(Version, Bytes)> {
        let state = self.state.lock();
        match state.teams.get(&team) {
            Some(t) => t.entries_in(begin, end).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Advance `team`'s popped version, reclaiming in-memory entries.
    ///
    /// Returns the new popped version.
    pub fn pop_team(&self, team: StorageTeamId, up_to: Version) -> Version {
        let mut state = self.state.lock();
        let t = state.teams.entry(team).or_insert_with(|| TeamData::new(team));
        t.pop(up_to);
        t.popped()
    }

    /// The earliest disk-queue location still needed by this generation, or
    /// `None` when nothing pins the queue.
    pub fn first_pinned_location(&self) -> Option<Location> {
        let state = self.state.lock();
        let min_pin = state
            .teams
            .values()
            .filter_map(|t| t.first_pinned(self.spills_by_reference(t.team)))
            .min()?;
        state
            .version_locations
            .range(min_pin..)
            .next()
            .map(|(_, (start, _))| *start)
            .or_else(|| {
                // A pinned version without a recorded frame: hold the queue
                // at the oldest location we still know about.
                state.version_locations.values().map(|(start, _)| *start).next()
            })
    }

    /// The end location of the generation's last framed entry.
    pub fn last_location_end(&self) -> Option<Location> {
        let state = self.state.lock();
        state.version_locations.values().last().map(|(_, end)| *end)
    }

    /// Drop location records below every team's pin; they can no longer
    /// constrain the queue.
    pub fn prune_version_locations(&self) {
        let mut state = self.state.lock();
        let min_pin = state
            .teams
            .values()
            .filter_map(|t| t.first_pinned(self.spills_by_reference(t.team)))
            .min();
        match min_pin {
            Some(v) => {
                state.version_locations = state.version_locations.split_off(&v);
            }
            None => {
                // Keep the last entry so the generation's end stays known.
                if state.version_locations.len() > 1 {
                    let (last_v, last_loc) = state
                        .version_locations
                        .iter()
                        .next_back()
                        .map(|(v, l)| (*v, *l))
                        .expect("non-empty map");
                    state.version_locations = BTreeMap::from([(last_v, last_loc)]);
                }
            }
        }
    }

    /// All assigned teams have popped through the generation's end and
    /// nothing pins the disk queue.
    pub fn fully_popped(&self) -> bool {
        let end = self.version.get();
        let state = self.state.lock();
        state.teams.values().all(|t| {
            t.popped() >= end.min(t.last_appended())
                && t.first_pinned(self.spills_by_reference(t.team)).is_none()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn generation() -> Arc<GenerationData> {
        GenerationData::new(
            LogId(1),
            TLogGroupId(1),
            Epoch(1),
            SpillType::Value,
            0,
            None,
            [StorageTeamId(1), StorageTeamId(2)],
            Arc::new(TLogConfig::default()),
        )
    }

    #[test]
    fn commit_messages_rejects_unknown_team() {
        let gen = generation();
        let err = gen
            .commit_messages(Version(10), StorageTeamId(99), b"data")
            .unwrap_err();
        assert!(matches!(err, TLogError::TeamNotFound(StorageTeamId(99))));
    }

    #[test]
    fn commit_messages_tracks_input_bytes() {
        let gen = generation();
        gen.commit_messages(Version(10), StorageTeamId(1), b"abcd").unwrap();
        gen.commit_messages(Version(20), StorageTeamId(2), b"ef").unwrap();
        assert_eq!(gen.bytes_input(), 6);
        assert_eq!(gen.memory_pressure(), 6);

        let entries = gen.peek_in_memory(StorageTeamId(1), Version::ZERO, Version(100));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], (Version(10), Bytes::from_static(b"abcd")));
    }

    #[test]
    fn oversized_message_is_accepted() {
        let config = TLogConfig {
            max_message_size: 4,
            ..TLogConfig::default()
        };
        let gen = GenerationData::new(
            LogId(1),
            TLogGroupId(1),
            Epoch(1),
            SpillType::Value,
            0,
            None,
            [StorageTeamId(1)],
            Arc::new(config),
        );
        // Over the limit: warned about, but still indexed.
        gen.commit_messages(Version(10), StorageTeamId(1), b"way past the limit")
            .unwrap();
        let entries = gen.peek_in_memory(StorageTeamId(1), Version::ZERO, Version(100));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn no_duplicate_versions_per_team() {
        let gen = generation();
        gen.commit_messages(Version(10), StorageTeamId(1), b"first").unwrap();
        gen.commit_messages(Version(10), StorageTeamId(1), b"again").unwrap();
        let entries = gen.peek_in_memory(StorageTeamId(1), Version::ZERO, Version(100));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, Bytes::from_static(b"first"));
    }

    #[test]
    fn stop_is_sticky_and_observable() {
        let gen = generation();
        assert!(!gen.is_stopped());
        gen.stop();
        gen.stop();
        assert!(gen.is_stopped());
        // Already-stopped generations resolve immediately.
        futures::executor::block_on(gen.when_stopped());
    }

    #[test]
    fn pinned_location_follows_pops() {
        let gen = generation();
        gen.commit_messages(Version(10), StorageTeamId(1), b"aaaa").unwrap();
        gen.record_version_location(Version(10), Location(0), Location(50));
        gen.commit_messages(Version(20), StorageTeamId(1), b"bbbb").unwrap();
        gen.record_version_location(Version(20), Location(50), Location(100));
        gen.version.set(Version(20));

        assert_eq!(gen.first_pinned_location(), Some(Location(0)));
        gen.pop_team(StorageTeamId(1), Version(10));
        assert_eq!(gen.first_pinned_location(), Some(Location(50)));
        gen.pop_team(StorageTeamId(1), Version(20));
        assert_eq!(gen.first_pinned_location(), None);
        assert!(gen.fully_popped());
    }
}
