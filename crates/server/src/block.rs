use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use log::warn;
use partlog_primitives::{StorageTeamId, Version};

/// Appends message payloads into shared, reference-counted byte blocks.
///
/// Team indices hold [`Bytes`] views into these blocks; a block's memory is
/// reclaimed once the last view into it is dropped (by spill or pop).
#[derive(Debug)]
pub struct MessageBlockArena {
    tail: BytesMut,
    default_block_bytes: usize,
    blocks_allocated: u64,
}

impl MessageBlockArena {
    pub fn new(default_block_bytes: usize) -> Self {
        Self {
            tail: BytesMut::new(),
            default_block_bytes,
            blocks_allocated: 0,
        }
    }

    /// Copy `payload` into the tail block, allocating a new block of
    /// `max(default_block_bytes, payload.len())` when the tail has no room,
    /// and return a view of the copied bytes.
    pub fn append(&mut self, payload: &[u8]) -> Bytes {
        if self.tail.capacity() < payload.len() {
            self.tail = BytesMut::with_capacity(self.default_block_bytes.max(payload.len()));
            self.blocks_allocated += 1;
        }
        self.tail.extend_from_slice(payload);
        self.tail.split_to(payload.len()).freeze()
    }

    /// Number of blocks allocated over the arena's lifetime.
    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated
    }
}

/// The in-memory, version-ordered message index of one storage team.
#[derive(Debug)]
pub struct TeamData {
    pub team: StorageTeamId,
    /// `(version, view-into-block)`, versions strictly increasing.
    entries: VecDeque<(Version, Bytes)>,
    /// Popped through this version (inclusive).
    popped: Version,
    /// Smallest spilled-by-reference version not yet popped, if any. Those
    /// records pin the disk queue: their bytes live nowhere else.
    ref_spilled_floor: Option<Version>,
    /// Highest version ever appended, surviving spill and pop.
    last_appended: Version,
    bytes_in_memory: u64,
}

impl TeamData {
    pub fn new(team: StorageTeamId) -> Self {
        Self {
            team,
            entries: VecDeque::new(),
            popped: Version::ZERO,
            ref_spilled_floor: None,
            last_appended: Version::ZERO,
            bytes_in_memory: 0,
        }
    }

    /// Append `data` at `version`. Versions must arrive in increasing order;
    /// a duplicate or regressing version is dropped.
    pub fn append(&mut self, version: Version, data: Bytes) {
        if let Some((last, _)) = self.entries.back() {
            if version <= *last {
                warn!(
                    "team {}: dropping out-of-order append at {version}, index is at {last}",
                    self.team
                );
                return;
            }
        }
        self.bytes_in_memory += data.len() as u64;
        self.last_appended = version;
        self.entries.push_back((version, data));
    }

    /// Highest version ever appended to this team, regardless of spill or
    /// pop state.
    pub fn last_appended(&self) -> Version {
        self.last_appended
    }

    /// In-memory entries with versions in `[begin, end]`.
    pub fn entries_in(&self, begin: Version, end: Version) -> impl Iterator<Item = &(Version, Bytes)> {
        self.entries
            .iter()
            .skip_while(move |(v, _)| *v < begin)
            .take_while(move |(v, _)| *v <= end)
    }

    /// Remove entries with `version <= up_to` from the front, returning
    /// them. Used by both spill (which re-homes them durably) and pop.
    pub fn take_through(&mut self, up_to: Version) -> Vec<(Version, Bytes)> {
        let mut taken = Vec::new();
        while let Some((v, _)) = self.entries.front() {
            if *v > up_to {
                break;
            }
            let (v, data) = self.entries.pop_front().expect("peeked entry");
            self.bytes_in_memory -= data.len() as u64;
            taken.push((v, data));
        }
        taken
    }

    /// Record that a batch of versions starting at `first` was spilled by
    /// reference.
    pub fn note_ref_spilled(&mut self, first: Version) {
        if self.ref_spilled_floor.is_none() {
            self.ref_spilled_floor = Some(first);
        }
    }

    /// Replace the reference-spill pin with a precise value, typically after
    /// consulting the spill records that remain in the store.
    pub fn set_ref_spill_floor(&mut self, floor: Option<Version>) {
        self.ref_spilled_floor = floor;
    }

    /// Acknowledge that versions `<= up_to` are durable on storage.
    pub fn pop(&mut self, up_to: Version) {
        if up_to <= self.popped {
            return;
        }
        self.popped = up_to;
        let dropped = self.take_through(up_to);
        drop(dropped);
        if let Some(floor) = self.ref_spilled_floor {
            if floor <= up_to {
                self.ref_spilled_floor = Some(up_to.next());
            }
        }
    }

    pub fn popped(&self) -> Version {
        self.popped
    }

    pub fn bytes_in_memory(&self) -> u64 {
        self.bytes_in_memory
    }

    pub fn first_version(&self) -> Option<Version> {
        self.entries.front().map(|(v, _)| *v)
    }

    pub fn last_version(&self) -> Option<Version> {
        self.entries.back().map(|(v, _)| *v)
    }

    /// The smallest version whose bytes are only recoverable from the disk
    /// queue: unspilled in-memory entries, and spilled-by-reference records
    /// that have not been popped.
    pub fn first_pinned(&self, spilled_by_reference: bool) -> Option<Version> {
        let mem = self.first_version();
        if !spilled_by_reference {
            return mem;
        }
        match (self.ref_spilled_floor, mem) {
            (Some(floor), Some(mem)) => Some(floor.min(mem)),
            (Some(floor), None) => Some(floor),
            (None, mem) => mem,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn team() -> TeamData {
        TeamData::new(StorageTeamId(1))
    }

    #[test]
    fn arena_shares_blocks_until_full() {
        let mut arena = MessageBlockArena::new(64);
        let a = arena.append(&[1; 16]);
        let b = arena.append(&[2; 16]);
        assert_eq!(arena.blocks_allocated(), 1);
        assert_eq!(a, Bytes::from(vec![1; 16]));
        assert_eq!(b, Bytes::from(vec![2; 16]));

        // An oversized payload gets a block of its own size.
        let big = arena.append(&[3; 100]);
        assert_eq!(arena.blocks_allocated(), 2);
        assert_eq!(big.len(), 100);
    }

    #[test]
    fn index_versions_are_strictly_increasing() {
        let mut t = team();
        t.append(Version(10), Bytes::from_static(b"a"));
        t.append(Version(10), Bytes::from_static(b"dup"));
        t.append(Version(5), Bytes::from_static(b"late"));
        t.append(Version(20), Bytes::from_static(b"b"));

        let versions: Vec<_> = t.entries_in(Version::ZERO, Version(100)).map(|(v, _)| *v).collect();
        assert_eq!(versions, vec![Version(10), Version(20)]);
    }

    #[test]
    fn pop_reclaims_prefix_only() {
        let mut t = team();
        for v in [10, 20, 30] {
            t.append(Version(v), Bytes::from(vec![0; 8]));
        }
        t.pop(Version(20));
        assert_eq!(t.popped(), Version(20));
        assert_eq!(t.first_version(), Some(Version(30)));
        assert_eq!(t.bytes_in_memory(), 8);

        // Popping backwards changes nothing.
        t.pop(Version(15));
        assert_eq!(t.popped(), Version(20));
        assert_eq!(t.first_version(), Some(Version(30)));
    }

    #[test]
    fn ref_spill_pins_queue_until_popped() {
        let mut t = team();
        for v in [10, 20, 30] {
            t.append(Version(v), Bytes::from(vec![0; 8]));
        }
        // Spill 10 and 20 by reference.
        t.take_through(Version(20));
        t.note_ref_spilled(Version(10));
        assert_eq!(t.first_pinned(true), Some(Version(10)));

        t.pop(Version(20));
        assert_eq!(t.first_pinned(true), Some(Version(21)));

        t.set_ref_spill_floor(None);
        assert_eq!(t.first_pinned(true), Some(Version(30)));
    }
}
