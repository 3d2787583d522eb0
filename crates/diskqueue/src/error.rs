use std::io;

use thiserror::Error;

use crate::{store::FileSlot, Location};

/// Error yielded by queue open, recovery and random-access reads.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue file {slot} has a corrupt header")]
    CorruptHeader { slot: FileSlot },
    #[error("queue files are not contiguous: older file ends at {older_end}, newer begins at {newer_begin}")]
    Discontiguous {
        older_end: Location,
        newer_begin: Location,
    },
    #[error("read of {len} bytes at {location} is outside the retained range {begin}..{end}")]
    OutOfRange {
        location: Location,
        len: usize,
        begin: Location,
        end: Location,
    },
    #[error("invalid frame at {location}")]
    InvalidFrame { location: Location },
    #[error(transparent)]
    Io(#[from] io::Error),
}
