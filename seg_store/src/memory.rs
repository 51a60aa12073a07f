//! In-memory segmented store.
//!
//! Mirrors the RocksDB backend closely enough for core tests: transactions
//! publish atomically, snapshots are point-in-time, and keys touched by an
//! open transaction make [`SegmentedStore::try_delete`] report contention.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::{
    KeyStream, Segment, SegmentedStore, StoreError, StoreResult, StoreSnapshot, StoreTransaction,
};

type SegmentMap = HashMap<Segment, BTreeMap<Vec<u8>, Vec<u8>>>;

fn empty_segments() -> SegmentMap {
    Segment::ALL
        .iter()
        .map(|segment| (*segment, BTreeMap::new()))
        .collect()
}

/// Heap-backed store used by unit tests and fixtures.
#[derive(Debug)]
pub struct MemorySegmentedStore {
    segments: RwLock<SegmentMap>,
    // Keys claimed by open transactions; consulted by `try_delete`.
    held_keys: Mutex<HashSet<(Segment, Vec<u8>)>>,
}

impl MemorySegmentedStore {
    /// Create an empty store with every well-known segment present.
    pub fn new() -> Self {
        Self {
            segments: RwLock::new(empty_segments()),
            held_keys: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for MemorySegmentedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentedStore for MemorySegmentedStore {
    fn get(&self, segment: Segment, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let segments = self.segments.read();
        let map = segments
            .get(&segment)
            .ok_or(StoreError::MissingSegment(segment))?;
        Ok(map.get(key).cloned())
    }

    fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(MemoryStoreTransaction {
            store: self,
            ops: Vec::new(),
        }))
    }

    fn stream_keys(&self, segment: Segment) -> StoreResult<KeyStream<'_>> {
        let segments = self.segments.read();
        let map = segments
            .get(&segment)
            .ok_or(StoreError::MissingSegment(segment))?;
        let keys: Vec<_> = map.keys().cloned().collect();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn try_delete(&self, segment: Segment, key: &[u8]) -> StoreResult<bool> {
        if self
            .held_keys
            .lock()
            .contains(&(segment, key.to_vec()))
        {
            return Ok(false);
        }

        let mut segments = self.segments.write();
        let map = segments
            .get_mut(&segment)
            .ok_or(StoreError::MissingSegment(segment))?;
        map.remove(key);
        Ok(true)
    }

    fn take_snapshot(&self) -> StoreResult<Box<dyn StoreSnapshot + '_>> {
        Ok(Box::new(MemoryStoreSnapshot {
            segments: self.segments.read().clone(),
        }))
    }

    fn drop_segment(&self, segment: Segment) -> StoreResult<()> {
        let mut segments = self.segments.write();
        segments.insert(segment, BTreeMap::new());
        Ok(())
    }
}

enum Op {
    Put(Segment, Vec<u8>, Vec<u8>),
    Remove(Segment, Vec<u8>),
}

struct MemoryStoreTransaction<'a> {
    store: &'a MemorySegmentedStore,
    ops: Vec<Op>,
}

impl MemoryStoreTransaction<'_> {
    fn claim(&self, segment: Segment, key: &[u8]) {
        self.store
            .held_keys
            .lock()
            .insert((segment, key.to_vec()));
    }

    fn release_claims(&self) {
        let mut held = self.store.held_keys.lock();
        for op in &self.ops {
            let (segment, key) = match op {
                Op::Put(segment, key, _) | Op::Remove(segment, key) => (segment, key),
            };
            held.remove(&(*segment, key.clone()));
        }
    }
}

impl StoreTransaction for MemoryStoreTransaction<'_> {
    fn put(&mut self, segment: Segment, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.claim(segment, key);
        self.ops.push(Op::Put(segment, key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn remove(&mut self, segment: Segment, key: &[u8]) -> StoreResult<()> {
        self.claim(segment, key);
        self.ops.push(Op::Remove(segment, key.to_vec()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        {
            let mut segments = self.store.segments.write();
            for op in &self.ops {
                match op {
                    Op::Put(segment, key, value) => {
                        let map = segments
                            .get_mut(segment)
                            .ok_or(StoreError::MissingSegment(*segment))?;
                        map.insert(key.clone(), value.clone());
                    }
                    Op::Remove(segment, key) => {
                        let map = segments
                            .get_mut(segment)
                            .ok_or(StoreError::MissingSegment(*segment))?;
                        map.remove(key);
                    }
                }
            }
        }

        self.release_claims();
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.release_claims();
        Ok(())
    }
}

impl Drop for MemoryStoreTransaction<'_> {
    fn drop(&mut self) {
        self.release_claims();
    }
}

struct MemoryStoreSnapshot {
    segments: SegmentMap,
}

impl StoreSnapshot for MemoryStoreSnapshot {
    fn get(&self, segment: Segment, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let map = self
            .segments
            .get(&segment)
            .ok_or(StoreError::MissingSegment(segment))?;
        Ok(map.get(key).cloned())
    }
}
