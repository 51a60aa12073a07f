//! RocksDB-backed segmented store.
//!
//! One column family per [`Segment`], opened through an optimistic
//! transaction DB so that writers get all-or-nothing commits and
//! [`SegmentedStore::try_delete`] can observe write conflicts instead of
//! blocking on them.

use std::path::Path;
use std::sync::Arc;

use log::warn;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, ErrorKind, IteratorMode, MultiThreaded,
    OptimisticTransactionDB, Options, SnapshotWithThreadMode, Transaction,
};

use crate::{
    KeyStream, Segment, SegmentedStore, StoreError, StoreResult, StoreSnapshot, StoreTransaction,
};

type Db = OptimisticTransactionDB<MultiThreaded>;

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn cf_of<'a>(db: &'a Db, segment: Segment) -> StoreResult<Arc<BoundColumnFamily<'a>>> {
    db.cf_handle(segment.name())
        .ok_or(StoreError::MissingSegment(segment))
}

/// An explicitly owned RocksDB store handle.
///
/// The handle is closed when the value is dropped; callers that need to
/// share it pass references (or wrap it in an `Arc`) rather than relying on
/// any process-wide cache.
pub struct RocksSegmentedStore {
    db: Db,
}

impl std::fmt::Debug for RocksSegmentedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksSegmentedStore").finish_non_exhaustive()
    }
}

impl RocksSegmentedStore {
    /// Open (creating if missing) a database with one column family per
    /// well-known segment.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Segment::ALL
            .iter()
            .map(|segment| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
                ColumnFamilyDescriptor::new(segment.name(), cf_opts)
            })
            .collect();

        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(backend)?;

        Ok(Self { db })
    }
}

impl SegmentedStore for RocksSegmentedStore {
    fn get(&self, segment: Segment, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let cf = cf_of(&self.db, segment)?;
        self.db.get_cf(&cf, key).map_err(backend)
    }

    fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(RocksStoreTransaction {
            db: &self.db,
            inner: Some(self.db.transaction()),
        }))
    }

    fn stream_keys(&self, segment: Segment) -> StoreResult<KeyStream<'_>> {
        let cf = cf_of(&self.db, segment)?;
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);

        Ok(Box::new(iter.map(|item| {
            item.map(|(key, _)| key.to_vec()).map_err(backend)
        })))
    }

    fn try_delete(&self, segment: Segment, key: &[u8]) -> StoreResult<bool> {
        let cf = cf_of(&self.db, segment)?;
        let tx = self.db.transaction();

        // Locking read, so a conflicting writer surfaces at commit time.
        tx.get_for_update_cf(&cf, key, true).map_err(backend)?;
        tx.delete_cf(&cf, key).map_err(backend)?;

        match tx.commit() {
            Ok(()) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain) => Ok(false),
            Err(e) => Err(backend(e)),
        }
    }

    fn take_snapshot(&self) -> StoreResult<Box<dyn StoreSnapshot + '_>> {
        Ok(Box::new(RocksStoreSnapshot {
            db: &self.db,
            inner: self.db.snapshot(),
        }))
    }

    fn drop_segment(&self, segment: Segment) -> StoreResult<()> {
        self.db.drop_cf(segment.name()).map_err(backend)?;

        let mut cf_opts = Options::default();
        cf_opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
        self.db.create_cf(segment.name(), &cf_opts).map_err(backend)
    }
}

struct RocksStoreTransaction<'a> {
    db: &'a Db,
    inner: Option<Transaction<'a, Db>>,
}

impl RocksStoreTransaction<'_> {
    fn inner(&self) -> StoreResult<&Transaction<'_, Db>> {
        self.inner
            .as_ref()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))
    }
}

impl StoreTransaction for RocksStoreTransaction<'_> {
    fn put(&mut self, segment: Segment, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let cf = cf_of(self.db, segment)?;
        self.inner()?.put_cf(&cf, key, value).map_err(backend)
    }

    fn remove(&mut self, segment: Segment, key: &[u8]) -> StoreResult<()> {
        let cf = cf_of(self.db, segment)?;
        self.inner()?.delete_cf(&cf, key).map_err(backend)
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        match self.inner.take() {
            Some(tx) => tx.commit().map_err(backend),
            None => Err(StoreError::Backend("transaction already finished".into())),
        }
    }

    fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        match self.inner.take() {
            Some(tx) => tx.rollback().map_err(backend),
            None => Err(StoreError::Backend("transaction already finished".into())),
        }
    }
}

impl Drop for RocksStoreTransaction<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.inner.take() {
            if let Err(e) = tx.rollback() {
                warn!("failed to roll back abandoned transaction: {e}");
            }
        }
    }
}

struct RocksStoreSnapshot<'a> {
    db: &'a Db,
    inner: SnapshotWithThreadMode<'a, Db>,
}

impl StoreSnapshot for RocksStoreSnapshot<'_> {
    fn get(&self, segment: Segment, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let cf = cf_of(self.db, segment)?;
        self.inner.get_cf(&cf, key).map_err(backend)
    }
}
