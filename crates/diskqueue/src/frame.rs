use std::collections::VecDeque;
use std::io;

use log::{debug, warn};

use crate::{
    error::QueueError,
    queue::DiskQueue,
    store::QueueStore,
    Location, Options,
};

/// Bytes a frame adds around its payload: a `u32` length prefix and the
/// trailing valid marker.
pub const FRAME_OVERHEAD: usize = 5;

const FRAME_VALID: u8 = 1;

/// A record replayed from the queue during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredFrame {
    /// Location of the frame's length prefix.
    pub start: Location,
    /// Location one past the frame's valid byte.
    pub end: Location,
    pub payload: Vec<u8>,
}

/// Record framing over a [`DiskQueue`]: `[len:u32][payload][valid:u8]`.
///
/// The length excludes the length field and the valid byte. A record whose
/// valid byte never became durable is a partial commit: recovery zero-fills
/// the tail up to a record boundary, so torn records are invisible and the
/// next push lands cleanly.
pub struct FramedQueue<S: QueueStore> {
    queue: DiskQueue<S>,
    recovered: VecDeque<RecoveredFrame>,
}

impl<S: QueueStore> FramedQueue<S> {
    /// Open the queue and replay intact records from `recover_at`.
    ///
    /// After this returns, every record whose [`Self::commit`] completed
    /// before the last shutdown is queued for [`Self::read_next`], in push
    /// order, and the write position is at the end of the last intact
    /// record.
    pub fn open(store: S, opts: Options, recover_at: Location) -> Result<Self, QueueError> {
        let mut queue = DiskQueue::open(store, opts)?;
        let (base, bytes) = queue.read_all_from(recover_at)?;
        let (frames, valid_end) = parse_frames(base, &bytes);
        if valid_end < queue.push_location() {
            warn!(
                "discarding partial tail: valid-end={valid_end} push-end={}",
                queue.push_location()
            );
            queue.zero_fill_tail(valid_end)?;
        }
        queue.pop(recover_at);
        debug!("recovered {} records, resuming at {valid_end}", frames.len());

        Ok(Self {
            queue,
            recovered: frames.into(),
        })
    }

    /// Append one record, returning the `(start, end)` locations of its
    /// frame.
    ///
    /// The record is durable once a subsequent [`Self::commit`] returns.
    pub fn push(&mut self, payload: &[u8]) -> io::Result<(Location, Location)> {
        debug_assert!(!payload.is_empty(), "empty records are indistinguishable from fill");
        let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf.push(FRAME_VALID);
        self.queue.push(&buf)
    }

    /// Make every previously pushed record durable.
    pub fn commit(&mut self) -> io::Result<()> {
        self.queue.commit()
    }

    /// Authorize reclamation of bytes strictly before `up_to`.
    pub fn pop(&mut self, up_to: Location) {
        self.queue.pop(up_to)
    }

    /// Consume the next record replayed by recovery.
    pub fn read_next(&mut self) -> Option<RecoveredFrame> {
        self.recovered.pop_front()
    }

    /// Read back the payload of the frame starting at `start`.
    ///
    /// Used to resolve spilled-by-reference records, which store frame
    /// locations instead of bytes.
    pub fn read_frame_at(&mut self, start: Location) -> Result<Vec<u8>, QueueError> {
        let len_bytes = self.queue.read_at(start, 4)?;
        let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
        if len == 0 {
            return Err(QueueError::InvalidFrame { location: start });
        }
        let mut rest = self.queue.read_at(Location(start.0 + 4), len + 1)?;
        if rest[len] != FRAME_VALID {
            return Err(QueueError::InvalidFrame { location: start });
        }
        rest.truncate(len);
        Ok(rest)
    }

    pub fn push_location(&self) -> Location {
        self.queue.push_location()
    }

    pub fn durable_location(&self) -> Location {
        self.queue.durable_location()
    }

    pub fn popped_location(&self) -> Location {
        self.queue.popped_location()
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.queue.bytes_in_use()
    }
}

/// Split `bytes` (starting at global location `base`) into intact frames.
///
/// Returns the frames and the location one past the last intact frame.
/// A short length field, a short payload, a zero length (fill) or a valid
/// byte other than `1` all terminate the scan.
fn parse_frames(base: Location, bytes: &[u8]) -> (Vec<RecoveredFrame>, Location) {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    loop {
        let rest = &bytes[pos..];
        if rest.len() < 4 {
            break;
        }
        let len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
        if len == 0 || rest.len() < 4 + len + 1 {
            break;
        }
        if rest[4 + len] != FRAME_VALID {
            break;
        }
        frames.push(RecoveredFrame {
            start: Location(base.0 + pos as u64),
            end: Location(base.0 + (pos + 4 + len + 1) as u64),
            payload: rest[4..4 + len].to_vec(),
        });
        pos += 4 + len + 1;
    }
    (frames, Location(base.0 + pos as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Memory;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn opts() -> Options {
        Options {
            max_file_bytes: 1024,
        }
    }

    fn reopen_payloads(store: &Memory) -> Vec<Vec<u8>> {
        let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
        let mut out = Vec::new();
        while let Some(frame) = queue.read_next() {
            out.push(frame.payload);
        }
        out
    }

    #[test]
    fn records_replay_in_push_order() {
        let store = Memory::new();
        {
            let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
            queue.push(b"a").unwrap();
            queue.push(b"bb").unwrap();
            queue.push(b"ccc").unwrap();
            queue.commit().unwrap();
        }
        assert_eq!(
            reopen_payloads(&store),
            vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]
        );
    }

    #[test]
    fn torn_valid_byte_discards_tail() {
        let store = Memory::new();
        let end_of_second;
        {
            let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
            queue.push(b"ten").unwrap();
            let (_, end) = queue.push(b"twenty").unwrap();
            end_of_second = end;
            queue.push(b"thirty").unwrap();
            queue.commit().unwrap();
        }
        // Chop the trailing byte of the last frame, as a crash between the
        // payload write and its durability would.
        {
            let file = store.raw(crate::store::FileSlot::Zero);
            let mut buf = file.buf_mut();
            let new_len = buf.len() - 1;
            buf.truncate(new_len);
        }

        let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
        assert_eq!(queue.read_next().unwrap().payload, b"ten");
        assert_eq!(queue.read_next().unwrap().payload, b"twenty");
        assert_eq!(queue.read_next(), None);
        assert_eq!(queue.push_location(), end_of_second);

        // The next push starts cleanly where the intact prefix ended.
        queue.push(b"forty").unwrap();
        queue.commit().unwrap();
        drop(queue);
        assert_eq!(
            reopen_payloads(&store),
            vec![b"ten".to_vec(), b"twenty".to_vec(), b"forty".to_vec()]
        );
    }

    #[test]
    fn read_frame_at_returns_payload() {
        let store = Memory::new();
        let mut queue = FramedQueue::open(store, opts(), Location::ZERO).unwrap();
        let (start, _) = queue.push(b"lookup me").unwrap();
        queue.push(b"other").unwrap();
        queue.commit().unwrap();
        assert_eq!(queue.read_frame_at(start).unwrap(), b"lookup me");
    }

    #[test]
    fn recovery_starts_at_saved_location() {
        let store = Memory::new();
        let skip_to;
        {
            let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
            let (_, end) = queue.push(b"popped already").unwrap();
            skip_to = end;
            queue.push(b"still needed").unwrap();
            queue.commit().unwrap();
        }
        let mut queue = FramedQueue::open(store, opts(), skip_to).unwrap();
        assert_eq!(queue.read_next().unwrap().payload, b"still needed");
        assert_eq!(queue.read_next(), None);
    }

    proptest! {
        #[test]
        fn push_all_read_all(payloads in proptest::collection::vec(
            proptest::collection::vec(1u8..=255, 1..64),
            1..32,
        )) {
            let store = Memory::new();
            {
                let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
                for p in &payloads {
                    queue.push(p).unwrap();
                }
                queue.commit().unwrap();
            }
            prop_assert_eq!(reopen_payloads(&store), payloads);
        }

        #[test]
        fn truncation_never_surfaces_partial_records(cut in 1usize..64) {
            let store = Memory::new();
            {
                let mut queue = FramedQueue::open(store.clone(), opts(), Location::ZERO).unwrap();
                queue.push(&[1; 20]).unwrap();
                queue.push(&[2; 20]).unwrap();
                queue.commit().unwrap();
            }
            {
                let file = store.raw(crate::store::FileSlot::Zero);
                let mut buf = file.buf_mut();
                let cut = cut.min(buf.len() - crate::queue::Header::LEN);
                let new_len = buf.len() - cut;
                buf.truncate(new_len);
            }
            let payloads = reopen_payloads(&store);
            // Whatever survives is an exact prefix of what was pushed.
            prop_assert!(payloads.len() <= 2);
            for (i, p) in payloads.iter().enumerate() {
                prop_assert_eq!(p, &vec![(i + 1) as u8; 20]);
            }
        }
    }
}
