use partlog_primitives::buf::{BufReader, BufWriter, DecodeError};
use partlog_primitives::varint::{decode_varint, encode_varint};
use partlog_primitives::{LogId, StorageTeamId, Version};

/// One commit's worth of messages for one team, as framed into the disk
/// queue.
///
/// `id` names the generation that wrote the entry, so recovery can route
/// entries of multiple generations sharing one group queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: LogId,
    pub storage_team: StorageTeamId,
    pub version: Version,
    pub known_committed_version: Version,
    pub messages: Vec<u8>,
}

impl QueueEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * 16 + 2 * 8 + 2 + self.messages.len());
        out.put_slice(&self.id.to_bytes());
        out.put_slice(&self.storage_team.to_bytes());
        out.put_u64(self.version.0);
        out.put_u64(self.known_committed_version.0);
        encode_varint(self.messages.len(), &mut out);
        out.put_slice(&self.messages);
        out
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let id = LogId::from_bytes(reader.get_array()?);
        let storage_team = StorageTeamId::from_bytes(reader.get_array()?);
        let version = Version(reader.get_u64()?);
        let known_committed_version = Version(reader.get_u64()?);
        let len = decode_varint(reader)?;
        let messages = reader.get_slice(len)?.to_vec();
        Ok(Self {
            id,
            storage_team,
            version,
            known_committed_version,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn roundtrip(
            id in any::<u128>(),
            team in any::<u128>(),
            version in any::<u64>(),
            kcv in any::<u64>(),
            messages in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let entry = QueueEntry {
                id: LogId(id),
                storage_team: StorageTeamId(team),
                version: Version(version),
                known_committed_version: Version(kcv),
                messages,
            };
            let encoded = entry.encode();
            let decoded = QueueEntry::decode(&mut encoded.as_slice()).unwrap();
            assert_eq!(entry, decoded);
        }
    }
}
