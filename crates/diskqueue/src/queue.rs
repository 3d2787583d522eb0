use std::io::{self, Read, Seek, SeekFrom, Write as _};

use log::{debug, warn};

use crate::{
    error::QueueError,
    store::{FileLike, FileSlot, QueueStore},
    Location, Options,
};

pub(crate) const MAGIC: [u8; 6] = [b'(', b'p', b'l', b'q', b')', b'1'];
pub(crate) const FORMAT_VERSION: u8 = 1;

/// Header at the start of each queue file.
///
/// `seq` orders the two files (higher is newer); a file whose length is
/// shorter than the header is considered unused. `begin` is the global
/// location of the first payload byte in this file, which makes locations
/// translatable to physical offsets without any per-record index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Header {
    pub seq: u64,
    pub begin: u64,
}

pub(crate) enum HeaderState {
    /// File is empty or too short to hold a header.
    Unused,
    /// Header bytes are present but fail magic or checksum validation.
    Invalid,
    Valid(Header),
}

impl Header {
    pub const LEN: usize = MAGIC.len() + /* version + reserved */ 2 + /* seq */ 8 + /* begin */ 8 + /* crc */ 4;

    pub fn write<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        let mut buf = [0u8; Self::LEN];
        buf[..MAGIC.len()].copy_from_slice(&MAGIC);
        buf[MAGIC.len()] = FORMAT_VERSION;
        buf[8..16].copy_from_slice(&self.seq.to_le_bytes());
        buf[16..24].copy_from_slice(&self.begin.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..24]);
        buf[24..].copy_from_slice(&crc.to_le_bytes());
        out.write_all(&buf)
    }

    pub fn decode<R: io::Read>(mut read: R, file_len: u64) -> io::Result<HeaderState> {
        if file_len < Self::LEN as u64 {
            return Ok(HeaderState::Unused);
        }
        let mut buf = [0u8; Self::LEN];
        read.read_exact(&mut buf)?;

        if !buf.starts_with(&MAGIC) || buf[MAGIC.len()] != FORMAT_VERSION {
            return Ok(HeaderState::Invalid);
        }
        let crc = u32::from_le_bytes(buf[24..].try_into().unwrap());
        if crc != crc32c::crc32c(&buf[..24]) {
            return Ok(HeaderState::Invalid);
        }

        Ok(HeaderState::Valid(Header {
            seq: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            begin: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        }))
    }
}

struct QueueFile<F> {
    file: F,
    /// Rotation sequence number; zero marks the file unused.
    seq: u64,
    /// Global location of the first payload byte.
    begin: u64,
    /// Payload bytes written after the header.
    data_len: u64,
    dirty: bool,
}

impl<F: FileLike> QueueFile<F> {
    fn in_use(&self) -> bool {
        self.seq != 0
    }

    fn end(&self) -> u64 {
        self.begin + self.data_len
    }
}

/// The append-only crash-safe byte queue.
///
/// Writes go to the file with the higher rotation sequence; once it exceeds
/// [`Options::max_file_bytes`] and the other file holds only popped bytes,
/// the other file is truncated, given a fresh header, and becomes the write
/// target. Reclamation of popped bytes thus happens at rotation time.
pub struct DiskQueue<S: QueueStore> {
    files: [QueueFile<S::File>; 2],
    /// Index into `files` of the write target.
    active: usize,
    /// Global location of the next byte to be pushed.
    push_loc: u64,
    /// Pushed bytes known durable, advanced by [`Self::commit`].
    durable_loc: u64,
    /// Bytes strictly before this location are authorized for reclamation.
    popped_loc: u64,
    opts: Options,
}

impl<S: QueueStore> DiskQueue<S> {
    /// Open the queue from `store`, validating file headers and ordering.
    ///
    /// A freshly created queue starts at location zero. A file with a torn
    /// header is recycled if the other file carries the data; if neither
    /// file has a usable header while bytes are present, the queue is
    /// corrupt.
    pub fn open(store: S, opts: Options) -> Result<Self, QueueError> {
        let mut files = Vec::with_capacity(2);
        let mut invalid = Vec::new();

        for slot in FileSlot::ALL {
            let mut file = store.open_file(slot)?;
            let len = file.file_len()?;
            file.seek(SeekFrom::Start(0))?;
            let (seq, begin, data_len) = match Header::decode(&mut file, len)? {
                HeaderState::Valid(hdr) => (hdr.seq, hdr.begin, len - Header::LEN as u64),
                HeaderState::Unused => (0, 0, 0),
                HeaderState::Invalid => {
                    invalid.push(slot);
                    (0, 0, 0)
                }
            };
            files.push(QueueFile {
                file,
                seq,
                begin,
                data_len,
                dirty: false,
            });
        }
        let mut files: [QueueFile<S::File>; 2] = match files.try_into() {
            Ok(files) => files,
            Err(_) => unreachable!("two slots"),
        };

        let valid_count = files.iter().filter(|f| f.in_use()).count();
        match invalid.as_slice() {
            [] => {}
            // A torn rotation: the new header never became durable. The
            // surviving file holds the whole retained range.
            [slot] if valid_count == 1 => {
                warn!("queue file {slot} has a torn header, recycling");
                files[slot.index()].file.ftruncate(0)?;
            }
            [slot, ..] => return Err(QueueError::CorruptHeader { slot: *slot }),
        }

        let (active, push_loc) = match (files[0].in_use(), files[1].in_use()) {
            (false, false) => {
                // Fresh queue.
                let hdr = Header { seq: 1, begin: 0 };
                let f = &mut files[0];
                f.file.seek(SeekFrom::Start(0))?;
                hdr.write(&mut f.file)?;
                f.file.fsync()?;
                f.seq = 1;
                (0, 0)
            }
            (true, false) => (0, files[0].end()),
            (false, true) => (1, files[1].end()),
            (true, true) => {
                let (older, newer) = if files[0].seq < files[1].seq { (0, 1) } else { (1, 0) };
                if files[older].end() != files[newer].begin {
                    return Err(QueueError::Discontiguous {
                        older_end: Location(files[older].end()),
                        newer_begin: Location(files[newer].begin),
                    });
                }
                (newer, files[newer].end())
            }
        };

        let popped_loc = files
            .iter()
            .filter(|f| f.in_use())
            .map(|f| f.begin)
            .min()
            .unwrap_or_default();

        debug!(
            "opened disk queue: begin={popped_loc} end={push_loc} active-slot={active} seqs=[{}, {}]",
            files[0].seq, files[1].seq
        );

        Ok(Self {
            files,
            active,
            push_loc,
            durable_loc: push_loc,
            popped_loc,
            opts,
        })
    }

    /// Append `bytes`, returning the `(start, end)` locations of the write.
    ///
    /// The write is buffered by the OS until the next [`Self::commit`].
    pub fn push(&mut self, bytes: &[u8]) -> io::Result<(Location, Location)> {
        self.maybe_rotate(bytes.len() as u64)?;

        let f = &mut self.files[self.active];
        f.file.seek(SeekFrom::Start(Header::LEN as u64 + f.data_len))?;
        f.file.write_all(bytes)?;
        f.data_len += bytes.len() as u64;
        f.dirty = true;

        let start = self.push_loc;
        self.push_loc += bytes.len() as u64;
        debug_assert_eq!(self.push_loc, self.files[self.active].end());

        Ok((Location(start), Location(self.push_loc)))
    }

    fn maybe_rotate(&mut self, incoming: u64) -> io::Result<()> {
        let active = &self.files[self.active];
        if active.data_len == 0 || active.data_len + incoming <= self.opts.max_file_bytes {
            return Ok(());
        }
        let next_seq = active.seq + 1;
        let other_idx = 1 - self.active;
        let other = &mut self.files[other_idx];
        let fully_popped = !other.in_use() || other.end() <= self.popped_loc;
        if !fully_popped {
            // The other file still holds unpopped bytes; keep growing.
            return Ok(());
        }

        debug!("rotating disk queue into slot {other_idx} at location {}", self.push_loc);
        other.file.ftruncate(0)?;
        other.file.seek(SeekFrom::Start(0))?;
        let hdr = Header {
            seq: next_seq,
            begin: self.push_loc,
        };
        hdr.write(&mut other.file)?;
        other.seq = next_seq;
        other.begin = self.push_loc;
        other.data_len = 0;
        other.dirty = true;
        self.active = other_idx;

        Ok(())
    }

    /// Make every previously pushed byte durable.
    pub fn commit(&mut self) -> io::Result<()> {
        for f in &mut self.files {
            if f.dirty {
                f.file.fsync()?;
                f.dirty = false;
            }
        }
        self.durable_loc = self.push_loc;
        Ok(())
    }

    /// Authorize reclamation of every byte strictly before `up_to`.
    pub fn pop(&mut self, up_to: Location) {
        self.popped_loc = self.popped_loc.max(up_to.0.min(self.push_loc));
    }

    /// Read all bytes in `[from, push_location)`, clamping `from` to the
    /// oldest retained location.
    pub fn read_all_from(&mut self, from: Location) -> Result<(Location, Vec<u8>), QueueError> {
        let begin = self.begin_retained().0;
        let from = from.0.clamp(begin, self.push_loc);

        let mut out = Vec::with_capacity((self.push_loc - from) as usize);
        let mut slots: Vec<usize> = (0..2).filter(|&i| self.files[i].in_use()).collect();
        slots.sort_by_key(|&i| self.files[i].seq);
        for idx in slots {
            let f = &mut self.files[idx];
            let start = from.max(f.begin);
            if start >= f.end() {
                continue;
            }
            f.file.seek(SeekFrom::Start(Header::LEN as u64 + (start - f.begin)))?;
            let len = (f.end() - start) as usize;
            let at = out.len();
            out.resize(at + len, 0);
            f.file.read_exact(&mut out[at..])?;
        }

        Ok((Location(from), out))
    }

    /// Read `len` bytes at `loc`. The range must lie within one file's
    /// retained payload.
    pub fn read_at(&mut self, loc: Location, len: usize) -> Result<Vec<u8>, QueueError> {
        let out_of_range = QueueError::OutOfRange {
            location: loc,
            len,
            begin: self.begin_retained(),
            end: Location(self.push_loc),
        };
        let Some(f) = self
            .files
            .iter_mut()
            .find(|f| f.in_use() && f.begin <= loc.0 && loc.0 + len as u64 <= f.end())
        else {
            return Err(out_of_range);
        };
        f.file.seek(SeekFrom::Start(Header::LEN as u64 + (loc.0 - f.begin)))?;
        let mut buf = vec![0; len];
        f.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Discard everything at and past `end`: zero the tail of the file
    /// containing it, fully reset any newer file, and resume writing at
    /// `end`.
    ///
    /// Called once by recovery after the last intact record has been
    /// located. Zeroed bytes never parse as a record, so a crash between
    /// this call and the next push is harmless.
    pub fn zero_fill_tail(&mut self, end: Location) -> io::Result<()> {
        let end = end.0.clamp(self.begin_retained().0, self.push_loc);

        let containing = (0..2)
            .filter(|&i| self.files[i].in_use() && self.files[i].begin <= end)
            .max_by_key(|&i| self.files[i].begin)
            .expect("some file contains every retained location");

        for idx in 0..2 {
            let f = &mut self.files[idx];
            if !f.in_use() {
                continue;
            }
            if idx != containing && f.begin >= end {
                debug!("resetting queue file slot {idx} past truncation point {end}");
                f.file.ftruncate(0)?;
                f.file.fsync()?;
                f.seq = 0;
                f.begin = 0;
                f.data_len = 0;
                f.dirty = false;
            }
        }

        let f = &mut self.files[containing];
        if f.end() > end {
            let zeros = [0u8; 64 * 1024];
            let mut remaining = f.end() - end;
            f.file.seek(SeekFrom::Start(Header::LEN as u64 + (end - f.begin)))?;
            while remaining > 0 {
                let n = remaining.min(zeros.len() as u64) as usize;
                f.file.write_all(&zeros[..n])?;
                remaining -= n as u64;
            }
            f.file.fsync()?;
            f.dirty = false;
            f.data_len = end - f.begin;
        }

        self.active = containing;
        self.push_loc = end;
        self.durable_loc = self.durable_loc.min(end);

        Ok(())
    }

    /// The oldest location still physically present.
    pub fn begin_retained(&self) -> Location {
        Location(
            self.files
                .iter()
                .filter(|f| f.in_use())
                .map(|f| f.begin)
                .min()
                .unwrap_or(self.push_loc),
        )
    }

    /// The location the next push will start at.
    pub fn push_location(&self) -> Location {
        Location(self.push_loc)
    }

    /// The durable prefix end, advanced by [`Self::commit`].
    pub fn durable_location(&self) -> Location {
        Location(self.durable_loc)
    }

    /// The reclamation frontier, advanced by [`Self::pop`].
    pub fn popped_location(&self) -> Location {
        Location(self.popped_loc)
    }

    /// Bytes pushed and not yet popped.
    pub fn bytes_in_use(&self) -> u64 {
        self.push_loc - self.popped_loc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Memory;

    fn small_opts() -> Options {
        Options { max_file_bytes: 64 }
    }

    #[test]
    fn header_roundtrip() {
        let hdr = Header { seq: 42, begin: 7777 };
        let mut buf = Vec::new();
        hdr.write(&mut buf).unwrap();
        assert_eq!(buf.len(), Header::LEN);
        match Header::decode(buf.as_slice(), buf.len() as u64).unwrap() {
            HeaderState::Valid(h2) => assert_eq!(hdr, h2),
            _ => panic!("expected valid header"),
        }
    }

    #[test]
    fn header_crc_detects_damage() {
        let hdr = Header { seq: 1, begin: 0 };
        let mut buf = Vec::new();
        hdr.write(&mut buf).unwrap();
        buf[10] ^= 0xff;
        assert!(matches!(
            Header::decode(buf.as_slice(), buf.len() as u64).unwrap(),
            HeaderState::Invalid
        ));
    }

    #[test]
    fn push_read_roundtrip() {
        let store = Memory::new();
        let mut queue = DiskQueue::open(store, small_opts()).unwrap();

        let (start, mid) = queue.push(b"hello ").unwrap();
        let (_, end) = queue.push(b"world").unwrap();
        assert_eq!(start, Location(0));
        assert_eq!(mid, Location(6));
        assert_eq!(end, Location(11));
        queue.commit().unwrap();

        let (from, bytes) = queue.read_all_from(Location::ZERO).unwrap();
        assert_eq!(from, Location::ZERO);
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn reopen_resumes_at_end() {
        let store = Memory::new();
        {
            let mut queue = DiskQueue::open(store.clone(), small_opts()).unwrap();
            queue.push(b"abc").unwrap();
            queue.commit().unwrap();
        }
        let mut queue = DiskQueue::open(store, small_opts()).unwrap();
        assert_eq!(queue.push_location(), Location(3));
        let (_, bytes) = queue.read_all_from(Location::ZERO).unwrap();
        assert_eq!(bytes, b"abc");
        let (start, _) = queue.push(b"d").unwrap();
        assert_eq!(start, Location(3));
    }

    #[test]
    fn rotation_requires_popped_other_file() {
        let store = Memory::new();
        let mut queue = DiskQueue::open(store.clone(), small_opts()).unwrap();

        // Fill past max_file_bytes; the other file is unused, so the next
        // push rotates.
        queue.push(&[1; 60]).unwrap();
        queue.push(&[2; 60]).unwrap();
        assert_eq!(queue.begin_retained(), Location::ZERO);

        // Nothing popped: a further push keeps growing the active file.
        queue.push(&[3; 60]).unwrap();
        queue.commit().unwrap();
        let (_, bytes) = queue.read_all_from(Location::ZERO).unwrap();
        assert_eq!(bytes.len(), 180);

        // Popping past the first file's content lets the next rotation
        // reclaim it.
        queue.pop(Location(180));
        queue.push(&[4; 60]).unwrap();
        queue.commit().unwrap();
        assert!(queue.begin_retained() > Location::ZERO);
        let (from, bytes) = queue.read_all_from(Location::ZERO).unwrap();
        assert_eq!(from, queue.begin_retained());
        assert_eq!(bytes.last(), Some(&4));
    }

    #[test]
    fn zero_fill_discards_tail() {
        let store = Memory::new();
        let mut queue = DiskQueue::open(store.clone(), small_opts()).unwrap();
        queue.push(b"keepdrop").unwrap();
        queue.commit().unwrap();

        queue.zero_fill_tail(Location(4)).unwrap();
        assert_eq!(queue.push_location(), Location(4));
        let (_, bytes) = queue.read_all_from(Location::ZERO).unwrap();
        assert_eq!(bytes, b"keep");

        // The zeroed region is overwritten by the next push.
        queue.push(b"new!").unwrap();
        let (_, bytes) = queue.read_all_from(Location::ZERO).unwrap();
        assert_eq!(bytes, b"keepnew!");
    }

    #[test]
    fn read_at_rejects_reclaimed_range() {
        let store = Memory::new();
        let mut queue = DiskQueue::open(store, small_opts()).unwrap();
        queue.push(&[7; 100]).unwrap();
        queue.pop(Location(100));
        // First rotation moves writes into the empty second file...
        queue.push(&[8; 50]).unwrap();
        // ...and rotating back into the first file reclaims its bytes.
        queue.push(&[9; 60]).unwrap();
        assert_eq!(queue.begin_retained(), Location(100));
        assert!(queue.read_at(Location(0), 10).is_err());
        assert_eq!(queue.read_at(Location(100), 50).unwrap(), vec![8; 50]);
    }
}
