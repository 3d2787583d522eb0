use std::{
    io,
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use super::{FileLike, FileSlot, QueueStore};

type SharedLock<T> = Arc<RwLock<T>>;
type SharedBytes = SharedLock<Vec<u8>>;

/// A queue file backed by a `Vec<u8>`.
///
/// Unlike a file opened with `O_APPEND`, writes land at the current seek
/// position, extending the buffer when they run past the end. This mirrors
/// the read-write mode the filesystem store uses.
///
/// Note that this is not a faithful model of a file, as safe Rust requires
/// to protect the buffer with a lock. This means that pathological
/// situations arising from concurrent read/write access of a file are
/// impossible to occur.
#[derive(Clone, Debug, Default)]
pub struct MemFile {
    pos: u64,
    buf: SharedBytes,
}

impl MemFile {
    pub fn len(&self) -> usize {
        self.buf.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Obtain mutable access to the underlying buffer.
    ///
    /// This is intended for tests which deliberately corrupt the queue data.
    pub fn buf_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buf.write().unwrap()
    }
}

impl From<SharedBytes> for MemFile {
    fn from(buf: SharedBytes) -> Self {
        Self { pos: 0, buf }
    }
}

impl FileLike for MemFile {
    fn fsync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn ftruncate(&mut self, size: u64) -> io::Result<()> {
        let mut inner = self.buf.write().unwrap();
        inner.resize(size as usize, 0);
        // NOTE: As per `ftruncate(2)`, the offset is not changed.
        Ok(())
    }

    fn file_len(&mut self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl io::Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.buf.write().unwrap();
        let pos = self.pos as usize;
        if inner.len() < pos + buf.len() {
            inner.resize(pos + buf.len(), 0);
        }
        inner[pos..pos + buf.len()].copy_from_slice(buf);
        self.pos += buf.len() as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let inner = self.buf.read().unwrap();
        let pos = self.pos as usize;
        if pos > inner.len() {
            // Bad file descriptor
            return Err(io::Error::from_raw_os_error(9));
        }
        let n = io::Read::read(&mut &inner[pos..], buf)?;
        self.pos += n as u64;

        Ok(n)
    }
}

impl io::Seek for MemFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (base_pos, offset) = match pos {
            io::SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            io::SeekFrom::End(n) => (self.len() as u64, n),
            io::SeekFrom::Current(n) => (self.pos, n),
        };
        match base_pos.checked_add_signed(offset) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

/// In-memory implementation of [`QueueStore`].
#[derive(Clone, Debug, Default)]
pub struct Memory([SharedBytes; 2]);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw bytes of the file in `slot`, for tests which truncate or
    /// corrupt them directly.
    pub fn raw(&self, slot: FileSlot) -> MemFile {
        MemFile::from(Arc::clone(&self.0[slot.index()]))
    }
}

impl QueueStore for Memory {
    type File = MemFile;

    fn open_file(&self, slot: FileSlot) -> io::Result<Self::File> {
        Ok(MemFile::from(Arc::clone(&self.0[slot.index()])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};

    #[test]
    fn mem_file_read_write_seek() {
        let mut file = MemFile::default();
        file.write_all(b"alonso").unwrap();

        file.seek(io::SeekFrom::Start(0)).unwrap();
        let mut buf = [0; 6];
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"alonso");

        // Positional overwrite, not append.
        file.seek(io::SeekFrom::Start(2)).unwrap();
        file.write_all(b"ZO").unwrap();
        file.seek(io::SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"alZOso");

        file.seek(io::SeekFrom::End(-3)).unwrap();
        let n = file.read(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[0..3], b"Oso");
    }
}
