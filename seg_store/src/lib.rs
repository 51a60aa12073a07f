//! Minimal contract for a segmented key-value store, along with the two
//! backends used by the Bonsai state tooling.
//!
//! A store is a set of named partitions ([`Segment`]s) of byte-key →
//! byte-value data with transactional writes, lazy key streaming and
//! point-in-time snapshots. The trie/verification core only ever talks to
//! this contract; everything engine-specific (column families, compaction,
//! open modes) stays behind [`rocks::RocksSegmentedStore`].

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

use std::fmt::{self, Display};

use thiserror::Error;

pub mod memory;
pub mod rocks;

pub use memory::MemorySegmentedStore;
pub use rocks::RocksSegmentedStore;

/// The well-known partitions of the world-state database.
///
/// The string names returned by [`Segment::name`] are shared across
/// implementations (they double as RocksDB column-family names), so they
/// must never change for an existing database.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Segment {
    /// Account trie nodes, keyed by the 32-byte node hash.
    AccountTrie,
    /// Storage trie nodes, keyed by the 32-byte node hash.
    StorageTrie,
    /// Flat account projection, keyed by address hash.
    FlatAccounts,
    /// Flat storage projection, keyed by address hash ‖ slot hash.
    FlatStorage,
    /// Contract code, keyed by code hash.
    Code,
    /// Per-block trie-log layers, keyed by block hash.
    TrieLog,
}

impl Segment {
    /// Every segment, in declaration order.
    pub const ALL: [Segment; 6] = [
        Segment::AccountTrie,
        Segment::StorageTrie,
        Segment::FlatAccounts,
        Segment::FlatStorage,
        Segment::Code,
        Segment::TrieLog,
    ];

    /// The cross-implementation segment identifier.
    pub const fn name(&self) -> &'static str {
        match self {
            Segment::AccountTrie => "ACCOUNT_TRIE",
            Segment::StorageTrie => "STORAGE_TRIE",
            Segment::FlatAccounts => "FLAT_ACCOUNTS",
            Segment::FlatStorage => "FLAT_STORAGE",
            Segment::Code => "CODE",
            Segment::TrieLog => "TRIE_LOG",
        }
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Stores the result of store operations. Returns a [`StoreError`] upon
/// failure.
pub type StoreResult<T> = Result<T, StoreError>;

/// A fault in the underlying storage engine.
///
/// Everything surfaced here (I/O errors, out-of-space, missing column
/// families) is fatal to the in-progress operation; none of the locally
/// recoverable trie anomalies ever show up as a `StoreError`.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum StoreError {
    /// The storage engine reported a failure.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// A segment handle could not be resolved (dropped or never created).
    #[error("segment {0} is not available in this store")]
    MissingSegment(Segment),
}

/// A lazily evaluated stream of keys within one segment.
pub type KeyStream<'a> = Box<dyn Iterator<Item = StoreResult<Vec<u8>>> + 'a>;

/// Named-partition byte store with transactional writes.
///
/// A handle supports any number of concurrent readers, but only one write
/// transaction may be open per handle at a time. That constraint, like the
/// requirement that [`SegmentedStore::drop_segment`] only runs with no
/// transaction in flight, is caller discipline and is not enforced here.
pub trait SegmentedStore {
    /// Look up a single key within a segment.
    fn get(&self, segment: Segment, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Open a write transaction batching puts/removes across segments with
    /// all-or-nothing commit.
    fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction + '_>>;

    /// Stream every key of a segment. The stream is finite and restartable
    /// per call, but not resumable mid-stream.
    fn stream_keys(&self, segment: Segment) -> StoreResult<KeyStream<'_>>;

    /// Best-effort, non-blocking delete.
    ///
    /// `Ok(true)` means the key is now absent; `Ok(false)` means another
    /// writer currently holds the key and the delete should be retried
    /// later. Contention is never an error on its own.
    fn try_delete(&self, segment: Segment, key: &[u8]) -> StoreResult<bool>;

    /// Expose a point-in-time read-only view isolated from later writers.
    fn take_snapshot(&self) -> StoreResult<Box<dyn StoreSnapshot + '_>>;

    /// Administrative drop-and-recreate of one segment, leaving it empty.
    ///
    /// Must only be called with no transaction in flight.
    fn drop_segment(&self, segment: Segment) -> StoreResult<()>;
}

/// A batch of puts/removes published atomically on commit.
///
/// Dropping an uncommitted transaction discards it.
pub trait StoreTransaction {
    /// Stage a write.
    fn put(&mut self, segment: Segment, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Stage a delete.
    fn remove(&mut self, segment: Segment, key: &[u8]) -> StoreResult<()>;

    /// Durably publish every staged write. Blocking; no async variant.
    fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discard every staged write.
    fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Read-only point-in-time view of a store.
pub trait StoreSnapshot {
    /// Look up a single key within a segment, as of snapshot time.
    fn get(&self, segment: Segment, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names_are_stable() {
        let names: Vec<_> = Segment::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [
                "ACCOUNT_TRIE",
                "STORAGE_TRIE",
                "FLAT_ACCOUNTS",
                "FLAT_STORAGE",
                "CODE",
                "TRIE_LOG"
            ]
        );
    }
}
