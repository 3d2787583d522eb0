//! An append-only, crash-safe byte queue over two physical files, plus the
//! record framing the TLog server writes through it.
//!
//! The [`DiskQueue`] hands out a [`Location`] per append: a global,
//! monotonically increasing byte offset. Consumers acknowledge durable
//! prefixes by popping up to a location, which allows the older of the two
//! files to be truncated and recycled the next time writes rotate into it.
//!
//! [`FramedQueue`] layers `[len:u32][payload][valid:u8]` records on top,
//! giving atomic append/commit semantics: a record either replays intact
//! after a crash or does not surface at all.

mod frame;
mod queue;

pub mod error;
pub mod store;

pub use crate::{
    frame::{FramedQueue, RecoveredFrame, FRAME_OVERHEAD},
    queue::DiskQueue,
    store::{FileLike, FileSlot, QueueStore},
};

use std::fmt;

/// An opaque ordered handle into the queue identifying a byte position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location(pub u64);

impl Location {
    pub const ZERO: Location = Location(0);
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// [`DiskQueue`] options.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// The number of payload bytes a queue file may hold before writes try
    /// to rotate into the other file.
    ///
    /// Rotation only happens when the other file is fully popped; until then
    /// the active file keeps growing past this size.
    ///
    /// Default: 128MiB
    pub max_file_bytes: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_file_bytes: 128 * 1024 * 1024,
        }
    }
}
