use log::trace;
use partlog_primitives::buf::{BufReader, BufWriter};
use partlog_primitives::Version;
use thiserror::Error;

use crate::{
    error::{Corrupt, DataError},
    hash::key_hash,
    mutation::VersionedMutations,
};

/// The only accepted file format version, stored big-endian at the start of
/// every block.
pub const LOG_FILE_VERSION: u32 = 2001;

/// Versions are bucketed by this quantity before hashing into record keys.
pub const LOG_RANGE_BLOCK_SIZE: u64 = 1_000_000;

/// Default size of the fixed blocks a file is divided into.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

const KEY_LEN: usize = 1 + 8 + 4;
const PADDING: u8 = 0xff;
/// Key length prefix, key, value length prefix.
const RECORD_OVERHEAD: usize = 4 + KEY_LEN + 4;
/// Block magic plus the smallest possible record.
const MIN_BLOCK_SIZE: usize = 4 + RECORD_OVERHEAD + 1;

/// Error returned by [`encode_file`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("block size {block_size} cannot hold a record")]
    BlockSizeTooSmall { block_size: usize },
    #[error("version {version} out of order after {prev}")]
    OutOfOrder { prev: Version, version: Version },
}

fn record_key(version: Version, part: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key[0] = key_hash(version.0 / LOG_RANGE_BLOCK_SIZE);
    key[1..9].copy_from_slice(&version.0.to_be_bytes());
    key[9..].copy_from_slice(&part.to_be_bytes());
    key
}

/// Serialize `groups` (ascending by version) into the blocked file format.
///
/// A version's value is split across as many records as needed to respect
/// `block_size`; parts count up from zero. Each block is padded to
/// `block_size` with `0xff`.
pub fn encode_file(groups: &[VersionedMutations], block_size: usize) -> Result<Vec<u8>, EncodeError> {
    if block_size < MIN_BLOCK_SIZE {
        return Err(EncodeError::BlockSizeTooSmall { block_size });
    }
    for pair in groups.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(EncodeError::OutOfOrder {
                prev: pair[0].version,
                version: pair[1].version,
            });
        }
    }

    let mut out = Vec::new();
    let mut block_start = 0;
    out.put_u32_be(LOG_FILE_VERSION);

    for group in groups {
        let value = group.encode_value();
        let mut offset = 0;
        let mut part: u32 = 0;
        while offset < value.len() {
            let remaining = block_size - (out.len() - block_start);
            if remaining < RECORD_OVERHEAD + 1 {
                // Seal the block and start the next one.
                out.resize(block_start + block_size, PADDING);
                block_start = out.len();
                out.put_u32_be(LOG_FILE_VERSION);
                continue;
            }
            let chunk = (value.len() - offset).min(remaining - RECORD_OVERHEAD);
            out.put_u32_be(KEY_LEN as u32);
            out.put_slice(&record_key(group.version, part));
            out.put_u32_be(chunk as u32);
            out.put_slice(&value[offset..offset + chunk]);
            offset += chunk;
            part += 1;
        }
        trace!("wrote version {} in {} part(s)", group.version, part);
    }

    out.resize(block_start + block_size, PADDING);
    Ok(out)
}

struct PartialGroup {
    version: Version,
    next_part: u32,
    value: Vec<u8>,
}

/// Decode a blocked backup mutation log file.
///
/// Multi-part values are stitched in part order before the mutation
/// sequence is decoded. Violations of the key, part or padding rules are
/// reported as the corresponding [`Corrupt`] variant.
pub fn decode_file(bytes: &[u8], block_size: usize) -> Result<Vec<VersionedMutations>, Corrupt> {
    let mut out = Vec::new();
    let mut pending: Option<PartialGroup> = None;
    let mut last_sealed: Option<Version> = None;

    let seal =
        |pending: &mut Option<PartialGroup>, out: &mut Vec<VersionedMutations>| -> Result<(), Corrupt> {
            if let Some(group) = pending.take() {
                out.push(VersionedMutations::decode_value(group.version, &group.value)?);
            }
            Ok(())
        };

    let mut block_start = 0;
    while block_start < bytes.len() {
        let block = &bytes[block_start..bytes.len().min(block_start + block_size)];
        let mut reader = block;

        let magic = reader.get_u32_be()?;
        if magic != LOG_FILE_VERSION {
            return Err(Corrupt::UnsupportedVersion { found: magic });
        }

        while reader.remaining() > 0 {
            if reader.clone().get_u8()? == PADDING {
                // The rest of the block must be padding.
                let pad_start = block.len() - reader.remaining();
                if let Some(pos) = reader.iter().position(|&b| b != PADDING) {
                    return Err(Corrupt::Padding {
                        offset: block_start + pad_start + pos,
                        found: reader[pos],
                    });
                }
                break;
            }

            let klen = reader.get_u32_be()? as usize;
            let key = reader.get_slice(klen)?;
            let vlen = reader.get_u32_be()? as usize;
            let value = reader.get_slice(vlen)?;

            if key.len() != KEY_LEN {
                return Err(DataError::KeyLength { len: key.len() }.into());
            }
            let hash = key[0];
            let version = Version(u64::from_be_bytes(key[1..9].try_into().unwrap()));
            let part = u32::from_be_bytes(key[9..].try_into().unwrap());

            if hash != key_hash(version.0 / LOG_RANGE_BLOCK_SIZE) {
                return Err(DataError::KeyHash { version, found: hash }.into());
            }

            match pending.as_mut() {
                Some(group) if group.version == version => {
                    if part != group.next_part {
                        return Err(DataError::PartGap {
                            version,
                            prev: group.next_part - 1,
                            next: part,
                        }
                        .into());
                    }
                    group.value.extend_from_slice(value);
                    group.next_part += 1;
                }
                _ => {
                    seal(&mut pending, &mut out)?;
                    if last_sealed.is_some_and(|sealed| version <= sealed) {
                        return Err(DataError::Resurrected { version }.into());
                    }
                    if part != 0 {
                        return Err(DataError::FirstPartNonZero { version, part }.into());
                    }
                    last_sealed = Some(version);
                    pending = Some(PartialGroup {
                        version,
                        next_part: 1,
                        value: value.to_vec(),
                    });
                }
            }
        }

        block_start += block_size;
    }

    seal(&mut pending, &mut out)?;
    Ok(out)
}
