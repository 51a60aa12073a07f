//! Staged application of trie-log layers onto the flat world state.
//!
//! A [`WorldStateAccumulator`] buffers the effect of one or more layers in
//! memory and publishes everything in a single store transaction on commit.
//! Layers apply in either direction: forward takes each change's updated
//! side, backward takes the prior side, so the same layer that replays a
//! block also rolls it back.

use std::collections::BTreeMap;

use ethereum_types::H256;
use keccak_hash::keccak;
use seg_store::{Segment, SegmentedStore, StoreError, StoreTransaction};
use thiserror::Error;

use crate::account::flat_storage_key;
use crate::trie_log::TrieLogLayer;

/// Staging a layer onto a closed accumulator.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ApplyError {
    /// The accumulator was already committed.
    #[error("accumulator already committed")]
    AccumulatorClosed,
}

/// In-memory overlay of flat-state changes, committed atomically.
#[derive(Debug)]
pub struct WorldStateAccumulator<'a, S: SegmentedStore + ?Sized> {
    store: &'a S,
    // Staged flat values; `None` stages a deletion.
    accounts: BTreeMap<H256, Option<Vec<u8>>>,
    storage: BTreeMap<(H256, H256), Option<Vec<u8>>>,
    code: BTreeMap<H256, Option<Vec<u8>>>,
    closed: bool,
}

impl<'a, S: SegmentedStore + ?Sized> WorldStateAccumulator<'a, S> {
    /// An empty accumulator over `store`.
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            accounts: BTreeMap::new(),
            storage: BTreeMap::new(),
            code: BTreeMap::new(),
            closed: false,
        }
    }

    /// `true` when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storage.is_empty() && self.code.is_empty()
    }

    /// Stages a layer in block order: every change lands on its updated
    /// side. Later layers overwrite earlier staged values key by key.
    pub fn apply_forward(&mut self, layer: &TrieLogLayer) -> Result<(), ApplyError> {
        self.apply(layer, |_prior, updated| updated)
    }

    /// Stages a layer in rollback order: every change lands on its prior
    /// side.
    pub fn apply_backward(&mut self, layer: &TrieLogLayer) -> Result<(), ApplyError> {
        self.apply(layer, |prior, _updated| prior)
    }

    fn apply<F>(&mut self, layer: &TrieLogLayer, pick: F) -> Result<(), ApplyError>
    where
        F: Fn(Option<Vec<u8>>, Option<Vec<u8>>) -> Option<Vec<u8>>,
    {
        if self.closed {
            return Err(ApplyError::AccumulatorClosed);
        }

        for (account_hash, change) in &layer.accounts {
            let value = pick(
                change.prior.as_ref().map(|a| a.to_rlp_bytes()),
                change.updated.as_ref().map(|a| a.to_rlp_bytes()),
            );
            self.accounts.insert(*account_hash, value);
        }

        for (account_hash, change) in &layer.code {
            let value = pick(change.prior.clone(), change.updated.clone());
            self.code.insert(*account_hash, value);
        }

        for (account_hash, slots) in &layer.storage {
            for (slot_hash, change) in slots {
                let value = pick(change.prior.clone(), change.updated.clone());
                self.storage.insert((*account_hash, *slot_hash), value);
            }
        }

        Ok(())
    }

    /// Publishes every staged change in one transaction and closes the
    /// accumulator.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        let mut tx = self.store.begin_transaction()?;

        for (account_hash, value) in &self.accounts {
            match value {
                Some(payload) => tx.put(Segment::FlatAccounts, account_hash.as_bytes(), payload)?,
                None => tx.remove(Segment::FlatAccounts, account_hash.as_bytes())?,
            }
        }

        for ((account_hash, slot_hash), value) in &self.storage {
            let key = flat_storage_key(*account_hash, *slot_hash);
            match value {
                Some(raw) => tx.put(Segment::FlatStorage, &key, raw)?,
                None => tx.remove(Segment::FlatStorage, &key)?,
            }
        }

        for value in self.code.values() {
            // Code is content-addressed and may be shared between accounts,
            // so staged deletions are not propagated.
            if let Some(code) = value {
                tx.put(Segment::Code, keccak(code).as_bytes(), code)?;
            }
        }

        tx.commit()?;

        self.accounts.clear();
        self.storage.clear();
        self.code.clear();
        self.closed = true;
        Ok(())
    }

    /// Discards every staged change, leaving the accumulator open.
    pub fn rollback(&mut self) {
        self.accounts.clear();
        self.storage.clear();
        self.code.clear();
    }
}

#[cfg(test)]
mod tests {
    use ethereum_types::U256;
    use seg_store::{MemorySegmentedStore, StoreTransaction};

    use super::*;
    use crate::account::AccountEntry;

    fn account_hash() -> H256 {
        H256::repeat_byte(0xaa)
    }

    fn nonce_layer(block: u8, prior_nonce: u64, updated_nonce: u64) -> TrieLogLayer {
        let mut layer = TrieLogLayer::new(H256::repeat_byte(block));
        layer.add_account_change(
            account_hash(),
            Some(AccountEntry::basic(prior_nonce, U256::from(10u64))),
            Some(AccountEntry::basic(updated_nonce, U256::from(10u64))),
        );
        layer
    }

    fn flat_account(store: &MemorySegmentedStore) -> Option<AccountEntry> {
        store
            .get(Segment::FlatAccounts, account_hash().as_bytes())
            .unwrap()
            .map(|bytes| AccountEntry::from_rlp_bytes(&bytes).unwrap())
    }

    #[test]
    fn forward_then_backward_restores_the_original_state() {
        let store = MemorySegmentedStore::new();
        let initial = AccountEntry::basic(1, U256::from(10u64));

        let mut tx = store.begin_transaction().unwrap();
        tx.put(
            Segment::FlatAccounts,
            account_hash().as_bytes(),
            &initial.to_rlp_bytes(),
        )
        .unwrap();
        tx.commit().unwrap();

        let layer = nonce_layer(0xb1, 1, 2);

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_forward(&layer).unwrap();
        accumulator.commit().unwrap();
        assert_eq!(flat_account(&store).unwrap().nonce, 2);

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_backward(&layer).unwrap();
        accumulator.commit().unwrap();
        assert_eq!(flat_account(&store), Some(initial));
    }

    #[test]
    fn mixed_layer_round_trips_the_flat_state() {
        let store = MemorySegmentedStore::new();

        let old_code = b"\x60\x01".to_vec();
        let new_code = b"\x60\x02\x60\x03".to_vec();
        let initial = AccountEntry {
            nonce: 1,
            balance: U256::from(10u64),
            storage_root: H256::repeat_byte(0x33),
            code_hash: keccak(&old_code),
        };
        let updated = AccountEntry {
            nonce: 2,
            code_hash: keccak(&new_code),
            ..initial.clone()
        };
        let slot_hash = H256::repeat_byte(0x01);
        let slot_key = flat_storage_key(account_hash(), slot_hash);

        let mut tx = store.begin_transaction().unwrap();
        tx.put(
            Segment::FlatAccounts,
            account_hash().as_bytes(),
            &initial.to_rlp_bytes(),
        )
        .unwrap();
        tx.put(Segment::FlatStorage, &slot_key, &[0x2a]).unwrap();
        tx.put(Segment::Code, keccak(&old_code).as_bytes(), &old_code)
            .unwrap();
        tx.commit().unwrap();

        let mut layer = TrieLogLayer::new(H256::repeat_byte(0xc1));
        layer.add_account_change(account_hash(), Some(initial.clone()), Some(updated.clone()));
        layer.add_storage_change(account_hash(), slot_hash, Some(vec![0x2a]), Some(vec![0x2b]));
        layer.add_code_change(account_hash(), Some(old_code.clone()), Some(new_code.clone()));

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_forward(&layer).unwrap();
        accumulator.commit().unwrap();

        assert_eq!(
            store
                .get(Segment::FlatAccounts, account_hash().as_bytes())
                .unwrap(),
            Some(updated.to_rlp_bytes())
        );
        assert_eq!(
            store.get(Segment::FlatStorage, &slot_key).unwrap(),
            Some(vec![0x2b])
        );
        assert_eq!(
            store
                .get(Segment::Code, keccak(&new_code).as_bytes())
                .unwrap(),
            Some(new_code.clone())
        );

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_backward(&layer).unwrap();
        accumulator.commit().unwrap();

        // The flat projections are byte-identical to the seeded state.
        assert_eq!(
            store
                .get(Segment::FlatAccounts, account_hash().as_bytes())
                .unwrap(),
            Some(initial.to_rlp_bytes())
        );
        assert_eq!(
            store.get(Segment::FlatStorage, &slot_key).unwrap(),
            Some(vec![0x2a])
        );
        // Content-addressed code is never unwritten; both blobs remain.
        assert_eq!(
            store
                .get(Segment::Code, keccak(&old_code).as_bytes())
                .unwrap(),
            Some(old_code)
        );
        assert_eq!(
            store
                .get(Segment::Code, keccak(&new_code).as_bytes())
                .unwrap(),
            Some(new_code)
        );
    }

    #[test]
    fn backward_application_removes_created_state() {
        let store = MemorySegmentedStore::new();

        let mut layer = TrieLogLayer::new(H256::repeat_byte(0xc2));
        layer.add_account_change(
            account_hash(),
            None,
            Some(AccountEntry::basic(0, U256::from(5u64))),
        );
        layer.add_storage_change(
            account_hash(),
            H256::repeat_byte(0x01),
            None,
            Some(vec![0x2a]),
        );

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_forward(&layer).unwrap();
        accumulator.commit().unwrap();

        let slot_key = flat_storage_key(account_hash(), H256::repeat_byte(0x01));
        assert!(flat_account(&store).is_some());
        assert_eq!(
            store.get(Segment::FlatStorage, &slot_key).unwrap(),
            Some(vec![0x2a])
        );

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_backward(&layer).unwrap();
        accumulator.commit().unwrap();

        assert_eq!(flat_account(&store), None);
        assert_eq!(store.get(Segment::FlatStorage, &slot_key).unwrap(), None);
    }

    #[test]
    fn committed_code_is_stored_by_content_hash() {
        let store = MemorySegmentedStore::new();
        let code = b"\x60\x00\x60\x00".to_vec();

        let mut layer = TrieLogLayer::new(H256::repeat_byte(0xd3));
        layer.add_code_change(account_hash(), None, Some(code.clone()));

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_forward(&layer).unwrap();
        accumulator.commit().unwrap();

        assert_eq!(
            store.get(Segment::Code, keccak(&code).as_bytes()).unwrap(),
            Some(code)
        );
    }

    #[test]
    fn code_deletions_are_not_propagated() {
        let store = MemorySegmentedStore::new();
        let code = b"\x60\x01".to_vec();

        let mut tx = store.begin_transaction().unwrap();
        tx.put(Segment::Code, keccak(&code).as_bytes(), &code).unwrap();
        tx.commit().unwrap();

        let mut layer = TrieLogLayer::new(H256::repeat_byte(0xd4));
        layer.add_code_change(account_hash(), Some(code.clone()), None);

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_forward(&layer).unwrap();
        accumulator.commit().unwrap();

        // Another account may still reference the same bytecode.
        assert_eq!(
            store.get(Segment::Code, keccak(&code).as_bytes()).unwrap(),
            Some(code)
        );
    }

    #[test]
    fn later_layers_overwrite_earlier_staged_values() {
        let store = MemorySegmentedStore::new();

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_forward(&nonce_layer(0xe1, 1, 2)).unwrap();
        accumulator.apply_forward(&nonce_layer(0xe2, 2, 3)).unwrap();
        accumulator.commit().unwrap();

        assert_eq!(flat_account(&store).unwrap().nonce, 3);
    }

    #[test]
    fn closed_accumulator_rejects_further_layers() {
        let store = MemorySegmentedStore::new();

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_forward(&nonce_layer(0xf1, 1, 2)).unwrap();
        accumulator.commit().unwrap();

        assert_eq!(
            accumulator.apply_forward(&nonce_layer(0xf2, 2, 3)),
            Err(ApplyError::AccumulatorClosed)
        );
    }

    #[test]
    fn rollback_discards_staged_changes() {
        let store = MemorySegmentedStore::new();

        let mut accumulator = WorldStateAccumulator::new(&store);
        accumulator.apply_forward(&nonce_layer(0xf3, 1, 2)).unwrap();
        accumulator.rollback();
        assert!(accumulator.is_empty());
        accumulator.commit().unwrap();

        assert_eq!(flat_account(&store), None);
    }
}
