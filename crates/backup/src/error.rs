use partlog_primitives::buf::DecodeError;
use partlog_primitives::Version;
use thiserror::Error;

/// Error yielded when decoding a backup mutation log file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Corrupt {
    #[error("unsupported file version: {found:#010x}")]
    UnsupportedVersion { found: u32 },
    #[error("padding byte {found:#04x} at offset {offset} is not 0xff")]
    Padding { offset: usize, found: u8 },
    #[error("corrupt data: {0}")]
    Data(#[from] DataError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Structural violations of record keys and multi-part value groups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("record key is {len} bytes, expected 13")]
    KeyLength { len: usize },
    #[error("key hash {found:#04x} does not match version {version}")]
    KeyHash { version: Version, found: u8 },
    #[error("version {version} starts at part {part}, expected 0")]
    FirstPartNonZero { version: Version, part: u32 },
    #[error("version {version} jumps from part {prev} to {next}")]
    PartGap { version: Version, prev: u32, next: u32 },
    #[error("version {version} declares {declared} value bytes but carries {actual}")]
    ValueLength {
        version: Version,
        declared: u32,
        actual: usize,
    },
    #[error("record for version {version} arrived after the group was sealed")]
    Resurrected { version: Version },
}
