//! Encoder and decoder for the durable backup mutation log file format.
//!
//! A log file is a sequence of fixed-size blocks. Each block starts with a
//! big-endian format version and holds length-prefixed key/value records;
//! the rest of the block is `0xff` padding. Record keys embed a one-byte
//! hash, the commit version and a part number; a version whose mutations do
//! not fit into one record is split across ascending parts which the
//! decoder stitches back together before decoding the mutation sequence.

pub mod error;
pub mod file;
pub mod hash;
pub mod mutation;

pub use crate::{
    error::{Corrupt, DataError},
    file::{decode_file, encode_file, DEFAULT_BLOCK_SIZE, LOG_FILE_VERSION, LOG_RANGE_BLOCK_SIZE},
    mutation::{Mutation, VersionedMutations},
};
