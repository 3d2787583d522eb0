//! Key families the TLog writes to its [`crate::KeyValueStore`].
//!
//! Every family is a byte prefix; per-generation keys append the `LogId`,
//! per-team keys append the `Tag`, and versioned keys append the version in
//! big-endian so byte-lexicographic order equals numeric order.

use partlog_primitives::{LogId, Tag, Version};

/// Store format marker, written once per group store.
pub const FORMAT: &[u8] = b"Format";
/// Value stored under [`FORMAT`].
pub const FORMAT_VALUE: &[u8] = b"partlog/LogServer/1/0";
/// Disk-queue replay start, maintained as pops become durable.
pub const RECOVERY_LOCATION: &[u8] = b"recoveryLocation";

const PROTOCOL_VERSION: &[u8] = b"ProtocolVersion/";
const SPILL_TYPE: &[u8] = b"TLogSpillType/";
const DB_RECOVERY_COUNT: &[u8] = b"DbRecoveryCount/";
const VERSION: &[u8] = b"version/";
const KNOWN_COMMITTED: &[u8] = b"knownCommitted/";
const LOCALITY: &[u8] = b"Locality/";
const TAG_MSG: &[u8] = b"TagMsg/";
const TAG_MSG_REF: &[u8] = b"TagMsgRef/";
const TAG_POP: &[u8] = b"TagPop/";

fn with_log_id(prefix: &[u8], log_id: LogId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + LogId::LEN);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&log_id.to_bytes());
    key
}

fn with_tag(prefix: &[u8], log_id: LogId, tag: Tag) -> Vec<u8> {
    let mut key = with_log_id(prefix, log_id);
    key.extend_from_slice(&tag.to_bytes());
    key
}

fn with_version(mut key: Vec<u8>, version: Version) -> Vec<u8> {
    key.extend_from_slice(&version.0.to_be_bytes());
    key
}

pub fn protocol_version(log_id: LogId) -> Vec<u8> {
    with_log_id(PROTOCOL_VERSION, log_id)
}

pub fn spill_type(log_id: LogId) -> Vec<u8> {
    with_log_id(SPILL_TYPE, log_id)
}

pub fn db_recovery_count(log_id: LogId) -> Vec<u8> {
    with_log_id(DB_RECOVERY_COUNT, log_id)
}

pub fn version(log_id: LogId) -> Vec<u8> {
    with_log_id(VERSION, log_id)
}

pub fn known_committed(log_id: LogId) -> Vec<u8> {
    with_log_id(KNOWN_COMMITTED, log_id)
}

pub fn locality(log_id: LogId) -> Vec<u8> {
    with_log_id(LOCALITY, log_id)
}

/// Spilled-by-value message blob for `(log_id, tag, version)`.
pub fn tag_msg(log_id: LogId, tag: Tag, version: Version) -> Vec<u8> {
    with_version(with_tag(TAG_MSG, log_id, tag), version)
}

/// Half-open key range covering spilled-by-value blobs of versions
/// `[begin, end)`.
pub fn tag_msg_range(log_id: LogId, tag: Tag, begin: Version, end: Version) -> (Vec<u8>, Vec<u8>) {
    (tag_msg(log_id, tag, begin), tag_msg(log_id, tag, end))
}

/// Spilled-by-reference record for `(log_id, tag, version)`.
pub fn tag_msg_ref(log_id: LogId, tag: Tag, version: Version) -> Vec<u8> {
    with_version(with_tag(TAG_MSG_REF, log_id, tag), version)
}

/// Half-open key range covering spilled-by-reference records of versions
/// `[begin, end)`.
pub fn tag_msg_ref_range(log_id: LogId, tag: Tag, begin: Version, end: Version) -> (Vec<u8>, Vec<u8>) {
    (tag_msg_ref(log_id, tag, begin), tag_msg_ref(log_id, tag, end))
}

/// Popped-through version of `(log_id, tag)`.
pub fn tag_pop(log_id: LogId, tag: Tag) -> Vec<u8> {
    with_tag(TAG_POP, log_id, tag)
}

/// Range covering the `version/` key of every persisted generation.
pub fn all_version_keys_range() -> (Vec<u8>, Vec<u8>) {
    prefix_range(VERSION)
}

/// Extract the `LogId` from a `version/<logId>` key.
pub fn parse_version_key(key: &[u8]) -> Option<LogId> {
    let suffix = key.strip_prefix(VERSION)?;
    Some(LogId::from_bytes(suffix.try_into().ok()?))
}

/// Range covering every `TagPop` key of one generation.
pub fn tag_pop_range(log_id: LogId) -> (Vec<u8>, Vec<u8>) {
    prefix_range(&with_log_id(TAG_POP, log_id))
}

/// Extract the `Tag` from a `TagPop/<logId><tag>` key.
pub fn parse_tag_pop_key(key: &[u8]) -> Option<Tag> {
    let suffix = key.strip_prefix(TAG_POP)?.get(LogId::LEN..)?;
    let bytes: [u8; Tag::LEN] = suffix.try_into().ok()?;
    Some(Tag(u128::from_be_bytes(bytes)))
}

/// Extract the trailing big-endian version from a `TagMsg`/`TagMsgRef` key.
pub fn parse_versioned_key(key: &[u8]) -> Option<Version> {
    let at = key.len().checked_sub(8)?;
    let bytes: [u8; 8] = key[at..].try_into().ok()?;
    Some(Version(u64::from_be_bytes(bytes)))
}

/// The half-open range of all keys sharing `prefix`.
pub fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let begin = prefix.to_vec();
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return (begin, end);
        }
        end.pop();
    }
    // All-0xff prefix: the range is unbounded above; a single 0xff-filled
    // key longer than any real key serves as the upper bound.
    (begin, vec![u8::MAX; prefix.len() + LogId::LEN + Tag::LEN + 9])
}

/// Key ranges clearing every durable trace of a generation.
pub fn all_ranges_for_log(log_id: LogId) -> Vec<(Vec<u8>, Vec<u8>)> {
    [
        PROTOCOL_VERSION,
        SPILL_TYPE,
        DB_RECOVERY_COUNT,
        VERSION,
        KNOWN_COMMITTED,
        LOCALITY,
        TAG_MSG,
        TAG_MSG_REF,
        TAG_POP,
    ]
    .iter()
    .map(|family| prefix_range(&with_log_id(family, log_id)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn version_suffix_sorts_numerically() {
        let log_id = LogId(7);
        let tag = Tag(9);
        let k1 = tag_msg(log_id, tag, Version(255));
        let k2 = tag_msg(log_id, tag, Version(256));
        let k3 = tag_msg(log_id, tag, Version(1 << 40));
        assert!(k1 < k2 && k2 < k3);
    }

    #[test]
    fn ranges_cover_only_their_tag() {
        let log_id = LogId(7);
        let (begin, end) = tag_msg_range(log_id, Tag(9), Version(10), Version(21));
        assert!(begin <= tag_msg(log_id, Tag(9), Version(10)));
        assert!(tag_msg(log_id, Tag(9), Version(20)) < end);
        assert!(tag_msg(log_id, Tag(9), Version(21)) >= end);
        assert!(tag_msg(log_id, Tag(10), Version(10)) >= end);
    }

    #[test]
    fn prefix_range_brackets_prefix() {
        let (begin, end) = prefix_range(b"TagPop/");
        assert_eq!(begin, b"TagPop/".to_vec());
        assert_eq!(end, b"TagPop0".to_vec());
    }
}
