use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use super::{FileLike, FileSlot, QueueStore};

const QUEUE_FILE_EXT: &str = "plq";

/// A [`QueueStore`] keeping its two files in a directory on disk.
#[derive(Clone, Debug)]
pub struct Fs {
    root: PathBuf,
}

impl Fs {
    /// Create a store rooted at `root`.
    ///
    /// The directory is created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the filename for the queue file in `slot`.
    pub fn file_path(&self, slot: FileSlot) -> PathBuf {
        self.root.join(format!("queue.{}.{}", slot.index(), QUEUE_FILE_EXT))
    }
}

impl FileLike for File {
    fn fsync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn ftruncate(&mut self, size: u64) -> io::Result<()> {
        self.set_len(size)
    }

    fn file_len(&mut self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }
}

impl QueueStore for Fs {
    type File = File;

    fn open_file(&self, slot: FileSlot) -> io::Result<Self::File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.file_path(slot))
    }
}
