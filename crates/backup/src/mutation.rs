use partlog_primitives::buf::{BufReader, BufWriter, DecodeError};
use partlog_primitives::Version;

use crate::error::{Corrupt, DataError};

/// Mutation type code for a point write.
pub const MUTATION_SET_VALUE: u32 = 0;
/// Mutation type code for a range clear.
pub const MUTATION_CLEAR_RANGE: u32 = 1;

/// One mutation as stored in the log: a type code and two parameters.
///
/// For a point write the parameters are key and value; for a range clear
/// they are the range's begin and end keys. Unknown type codes round-trip
/// untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mutation {
    pub mutation_type: u32,
    pub param1: Vec<u8>,
    pub param2: Vec<u8>,
}

impl Mutation {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            mutation_type: MUTATION_SET_VALUE,
            param1: key.into(),
            param2: value.into(),
        }
    }

    pub fn clear_range(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            mutation_type: MUTATION_CLEAR_RANGE,
            param1: begin.into(),
            param2: end.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        3 * 4 + self.param1.len() + self.param2.len()
    }

    pub fn encode(&self, buf: &mut impl BufWriter) {
        buf.put_u32(self.mutation_type);
        buf.put_u32(self.param1.len() as u32);
        buf.put_u32(self.param2.len() as u32);
        buf.put_slice(&self.param1);
        buf.put_slice(&self.param2);
    }

    pub fn decode<'a>(reader: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let mutation_type = reader.get_u32()?;
        let p1len = reader.get_u32()? as usize;
        let p2len = reader.get_u32()? as usize;
        let param1 = reader.get_slice(p1len)?.to_vec();
        let param2 = reader.get_slice(p2len)?.to_vec();
        Ok(Self {
            mutation_type,
            param1,
            param2,
        })
    }
}

/// All mutations committed at one version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedMutations {
    pub version: Version,
    pub mutations: Vec<Mutation>,
}

impl VersionedMutations {
    /// Serialize into the record-value form: `version ‖ len ‖ mutations`,
    /// where `len` counts the mutation bytes only.
    pub fn encode_value(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for m in &self.mutations {
            m.encode(&mut body);
        }
        let mut out = Vec::with_capacity(12 + body.len());
        out.put_u64(self.version.0);
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        out
    }

    /// Decode from a (stitched) record value.
    ///
    /// `key_version` is the version carried by the record key(s); the value
    /// restates it, and the declared length must account for every byte.
    pub fn decode_value(key_version: Version, value: &[u8]) -> Result<Self, Corrupt> {
        let mut reader = value;
        let version = Version(reader.get_u64()?);
        let declared = reader.get_u32()?;
        if declared as usize != value.len() - 12 {
            return Err(DataError::ValueLength {
                version: key_version,
                declared,
                actual: value.len() - 12,
            }
            .into());
        }

        let mut mutations = Vec::new();
        while reader.remaining() > 0 {
            mutations.push(Mutation::decode(&mut reader)?);
        }

        Ok(Self { version, mutations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn arb_mutation() -> impl Strategy<Value = Mutation> {
        (
            0u32..4,
            proptest::collection::vec(any::<u8>(), 0..32),
            proptest::collection::vec(any::<u8>(), 0..32),
        )
            .prop_map(|(mutation_type, param1, param2)| Mutation {
                mutation_type,
                param1,
                param2,
            })
    }

    proptest! {
        #[test]
        fn value_roundtrip(
            version in any::<u64>(),
            mutations in proptest::collection::vec(arb_mutation(), 0..8),
        ) {
            let vm = VersionedMutations { version: Version(version), mutations };
            let value = vm.encode_value();
            let decoded = VersionedMutations::decode_value(vm.version, &value).unwrap();
            prop_assert_eq!(vm, decoded);
        }
    }

    #[test]
    fn declared_length_must_cover_all_bytes() {
        let vm = VersionedMutations {
            version: Version(9),
            mutations: vec![Mutation::set(b"k".as_slice(), b"v".as_slice())],
        };
        let mut value = vm.encode_value();
        // Shrink the declared length; the trailing bytes become unaccounted.
        value[8] -= 1;
        assert_eq!(
            VersionedMutations::decode_value(Version(9), &value),
            Err(DataError::ValueLength {
                version: Version(9),
                declared: (value.len() - 12 - 1) as u32,
                actual: value.len() - 12,
            }
            .into())
        );
    }
}
