use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt as _;
use parking_lot::RwLock;

use crate::{KeyValueStore, KvError};

enum Mutation {
    Set(Vec<u8>, Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
}

#[derive(Default)]
struct Inner {
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    staged: Vec<Mutation>,
}

/// In-memory implementation of [`KeyValueStore`].
///
/// Staged mutations live in an ordered journal until [`commit`] folds them
/// into the committed map, so readers see snapshots exactly as a durable
/// engine would present them.
///
/// [`commit`]: KeyValueStore::commit
#[derive(Clone, Default)]
pub struct Memory(Arc<RwLock<Inner>>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed keys, for tests asserting on cleanup.
    pub fn committed_len(&self) -> usize {
        self.0.read().committed.len()
    }
}

impl KeyValueStore for Memory {
    fn set(&self, key: &[u8], value: &[u8]) {
        self.0
            .write()
            .staged
            .push(Mutation::Set(key.to_vec(), value.to_vec()));
    }

    fn clear_range(&self, begin: &[u8], end: &[u8]) {
        self.0
            .write()
            .staged
            .push(Mutation::ClearRange(begin.to_vec(), end.to_vec()));
    }

    fn commit(&self) -> BoxFuture<'_, Result<(), KvError>> {
        let mut inner = self.0.write();
        let staged = std::mem::take(&mut inner.staged);
        for m in staged {
            match m {
                Mutation::Set(k, v) => {
                    inner.committed.insert(k, v);
                }
                Mutation::ClearRange(begin, end) => {
                    let doomed: Vec<_> = inner
                        .committed
                        .range::<[u8], _>((Bound::Included(&begin[..]), Bound::Excluded(&end[..])))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        inner.committed.remove(&k);
                    }
                }
            }
        }
        future::ready(Ok(())).boxed()
    }

    fn read_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.0.read().committed.get(key).cloned())
    }

    fn read_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let inner = self.0.read();
        let iter = inner
            .committed
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    fn storage_bytes(&self) -> Result<u64, KvError> {
        let inner = self.0.read();
        Ok(inner
            .committed
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_observe_only_committed_state() {
        let store = Memory::new();
        store.set(b"a", b"1");
        assert_eq!(store.read_value(b"a").unwrap(), None);

        futures::executor::block_on(store.commit()).unwrap();
        assert_eq!(store.read_value(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn commit_applies_mutations_in_staging_order() {
        let store = Memory::new();
        store.set(b"k1", b"old");
        store.clear_range(b"k0", b"k9");
        store.set(b"k1", b"new");
        futures::executor::block_on(store.commit()).unwrap();

        assert_eq!(store.read_value(b"k1").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn range_scan_is_ordered_and_bounded() {
        let store = Memory::new();
        for k in [&b"b"[..], b"a", b"d", b"c"] {
            store.set(k, k);
        }
        futures::executor::block_on(store.commit()).unwrap();

        let all = store.read_range(b"a", b"d", None).unwrap();
        let keys: Vec<_> = all.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"c"]);

        let limited = store.read_range(b"a", b"z", Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }
}
