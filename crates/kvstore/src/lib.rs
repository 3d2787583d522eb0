//! The durable metadata and spill store of a TLog group.
//!
//! Keys are ordered byte-lexicographically. Writes are staged and become
//! visible atomically at [`KeyValueStore::commit`]; readers always observe
//! the latest committed snapshot, never staged state. The in-memory
//! implementation in [`mem`] is the reference for those semantics and the
//! default store for tests; production deployments plug in a durable engine
//! behind the same trait.

use std::io;

use futures::future::BoxFuture;
use thiserror::Error;

pub mod keys;
pub mod mem;

pub use mem::Memory;

/// Error surfaced by store operations.
#[derive(Debug, Error)]
pub enum KvError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("store is closed")]
    Closed,
}

/// An ordered, durable key/value store with atomic commits.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Stage a write of `key` to `value`.
    fn set(&self, key: &[u8], value: &[u8]);

    /// Stage removal of every key in `[begin, end)`.
    fn clear_range(&self, begin: &[u8], end: &[u8]);

    /// Atomically apply and persist all staged mutations, in the order they
    /// were staged.
    fn commit(&self) -> BoxFuture<'_, Result<(), KvError>>;

    /// Read `key` from the latest committed snapshot.
    fn read_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Ordered scan of the committed snapshot over `[begin, end)`, yielding
    /// at most `limit` pairs when given.
    fn read_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;

    /// Estimate of the committed store size in bytes, for queuing metrics.
    fn storage_bytes(&self) -> Result<u64, KvError>;
}
