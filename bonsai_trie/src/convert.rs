//! Migration between the two physical world-state layouts.
//!
//! The forest layout keeps only the hash-keyed tries; the bonsai layout
//! additionally mirrors every leaf into the flat projections. Converting to
//! bonsai therefore rebuilds both flat segments from a full trie walk, and
//! converting to forest drops them.

use std::sync::atomic::{AtomicBool, Ordering};

use ethereum_types::H256;
use log::info;
use seg_store::{Segment, SegmentedStore, StoreError, StoreTransaction};
use thiserror::Error;

use crate::account::flat_storage_key;
use crate::listener::{TraversalListener, TrieType};
use crate::location::Location;
use crate::traversal::{TraversalError, TrieTraversal};

// Flat writes per transaction during a rebuild.
const BATCH_OPS: usize = 10_000;

/// A failed layout conversion.
#[derive(Clone, Debug, Error)]
pub enum ConvertError {
    /// The storage engine failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The underlying trie walk aborted.
    #[error(transparent)]
    Traversal(TraversalError),
}

/// What a conversion did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConvertReport {
    /// Trie nodes visited by the walk.
    pub visited: u64,
    /// Flat entries written (bonsai direction only).
    pub entries_written: u64,
}

/// Converts a store between the forest and bonsai layouts.
#[derive(Debug)]
pub struct DatabaseConverter<'a, S: SegmentedStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: SegmentedStore + ?Sized> DatabaseConverter<'a, S> {
    /// A converter over `store`.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Rebuilds both flat projections from the tries under `root`.
    ///
    /// The flat segments are dropped up front, so a failed conversion leaves
    /// the store in the forest layout rather than with half-stale mirrors.
    /// Trie anomalies found along the way go to `listener`; the affected
    /// leaves are simply absent from the rebuilt projection.
    pub fn convert_to_bonsai<L: TraversalListener>(
        &self,
        root: H256,
        listener: &mut L,
    ) -> Result<ConvertReport, ConvertError> {
        self.store.drop_segment(Segment::FlatAccounts)?;
        self.store.drop_segment(Segment::FlatStorage)?;

        let stop = AtomicBool::new(false);
        let mut rebuild = FlatRebuildListener {
            store: self.store,
            inner: listener,
            batch: Vec::new(),
            written: 0,
            error: None,
            stop: &stop,
        };

        let walk = TrieTraversal::new(self.store, &mut rebuild)
            .with_stop_flag(&stop)
            .traverse(root);

        // A write failure raises the stop flag, so surface it ahead of the
        // resulting cancellation.
        if let Some(err) = rebuild.error.take() {
            return Err(err.into());
        }
        let visited = walk.map_err(ConvertError::Traversal)?;

        rebuild.flush()?;
        let entries_written = rebuild.written;
        info!("rebuilt {entries_written} flat entries from {visited} trie nodes");

        Ok(ConvertReport {
            visited,
            entries_written,
        })
    }

    /// Verifies the tries under `root`, then drops both flat projections.
    pub fn convert_to_forest<L: TraversalListener>(
        &self,
        root: H256,
        listener: &mut L,
    ) -> Result<ConvertReport, ConvertError> {
        let visited = TrieTraversal::new(self.store, listener)
            .traverse(root)
            .map_err(ConvertError::Traversal)?;

        self.store.drop_segment(Segment::FlatAccounts)?;
        self.store.drop_segment(Segment::FlatStorage)?;
        info!("dropped flat projections after visiting {visited} trie nodes");

        Ok(ConvertReport {
            visited,
            entries_written: 0,
        })
    }
}

/// Captures trie leaves into batched flat writes, forwarding everything else
/// to the wrapped listener. Flat-mismatch events are swallowed: the mirrors
/// are empty while they are being rebuilt.
struct FlatRebuildListener<'a, S: SegmentedStore + ?Sized, L: TraversalListener> {
    store: &'a S,
    inner: &'a mut L,
    batch: Vec<(Segment, Vec<u8>, Vec<u8>)>,
    written: u64,
    error: Option<StoreError>,
    stop: &'a AtomicBool,
}

impl<S: SegmentedStore + ?Sized, L: TraversalListener> FlatRebuildListener<'_, S, L> {
    fn stage(&mut self, segment: Segment, key: Vec<u8>, value: Vec<u8>) {
        self.batch.push((segment, key, value));
        if self.batch.len() >= BATCH_OPS {
            if let Err(err) = self.flush() {
                self.error = Some(err);
                self.stop.store(true, Ordering::Relaxed);
            }
        }
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.store.begin_transaction()?;
        for (segment, key, value) in self.batch.drain(..) {
            tx.put(segment, &key, &value)?;
            self.written += 1;
        }
        tx.commit()
    }
}

impl<S: SegmentedStore + ?Sized, L: TraversalListener> TraversalListener
    for FlatRebuildListener<'_, S, L>
{
    fn root(&mut self, hash: H256) {
        self.inner.root(hash);
    }

    fn missing_code_hash(&mut self, code_hash: H256, account_hash: H256) {
        self.inner.missing_code_hash(code_hash, account_hash);
    }

    fn invalid_code(&mut self, account_hash: H256, expected: H256, found: H256) {
        self.inner.invalid_code(account_hash, expected, found);
    }

    fn missing_value_for_node(&mut self, hash: H256) {
        self.inner.missing_value_for_node(hash);
    }

    fn visited(&mut self, trie_type: TrieType) {
        self.inner.visited(trie_type);
    }

    fn missing_account_trie_for_hash(&mut self, hash: H256, location: &Location) {
        self.inner.missing_account_trie_for_hash(hash, location);
    }

    fn invalid_account_trie_for_hash(&mut self, hash: H256, location: &Location, found: H256) {
        self.inner
            .invalid_account_trie_for_hash(hash, location, found);
    }

    fn missing_storage_trie_for_hash(&mut self, hash: H256, location: &Location) {
        self.inner.missing_storage_trie_for_hash(hash, location);
    }

    fn invalid_storage_trie_for_hash(
        &mut self,
        account_hash: H256,
        hash: H256,
        location: &Location,
        found: H256,
    ) {
        self.inner
            .invalid_storage_trie_for_hash(account_hash, hash, location, found);
    }

    fn different_data_in_flat_database_for_account(&mut self, _account_hash: H256) {}

    fn different_data_in_flat_database_for_storage(
        &mut self,
        _account_hash: H256,
        _slot_hash: H256,
    ) {
    }

    fn account_leaf(&mut self, account_hash: H256, value: &[u8]) {
        self.inner.account_leaf(account_hash, value);
        self.stage(
            Segment::FlatAccounts,
            account_hash.as_bytes().to_vec(),
            value.to_vec(),
        );
    }

    fn storage_leaf(&mut self, account_hash: H256, slot_hash: H256, value: &[u8]) {
        self.inner.storage_leaf(account_hash, slot_hash, value);
        self.stage(
            Segment::FlatStorage,
            flat_storage_key(account_hash, slot_hash).to_vec(),
            value.to_vec(),
        );
    }
}
