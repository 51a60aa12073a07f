//! The depth-first world-state walk.
//!
//! Starting from a state root, [`TrieTraversal`] descends the account trie
//! and, for each account leaf, the account's storage trie. Every node fetch
//! is cross-checked against its content address, every leaf against its flat
//! projection, and every code hash against the code segment. Locally bad
//! data (missing nodes, hash mismatches, undecodable bytes) is reported to
//! the listener and the subtree below it skipped; the walk only aborts on
//! storage faults, cancellation, or a hash cycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use ethereum_types::H256;
use keccak_hash::keccak;
use log::warn;
use rlp::Rlp;
use seg_store::{Segment, SegmentedStore, StoreError};
use thiserror::Error;

use crate::account::{flat_storage_key, AccountEntry};
use crate::listener::{TraversalListener, TrieType};
use crate::location::Location;
use crate::node::{decode_node, node_hash, DecodedNode, NodeHandle, EMPTY_TRIE_HASH};

/// An error that aborts a traversal outright.
///
/// Trie anomalies never show up here; they go to the listener and the walk
/// continues around them.
#[derive(Clone, Debug, Error)]
pub enum TraversalError {
    /// The storage engine failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// A node hash already on the descent path was referenced again below
    /// itself. Continuing would loop forever.
    #[error("node {hash:?} references itself via location {location}")]
    CycleDetected {
        /// The hash seen twice on one descent path.
        hash: H256,
        /// Where the second reference was found.
        location: Location,
    },

    /// The stop flag was raised.
    #[error("traversal cancelled")]
    Cancelled,
}

/// Depth-first account- and storage-trie walker.
pub struct TrieTraversal<'a, S: SegmentedStore + ?Sized, L: TraversalListener> {
    store: &'a S,
    listener: &'a mut L,
    stop: Option<&'a AtomicBool>,
    visited: u64,
    // Hashes on the current descent path, for cycle detection.
    descent: HashSet<H256>,
}

impl<S: SegmentedStore + ?Sized, L: TraversalListener> std::fmt::Debug
    for TrieTraversal<'_, S, L>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieTraversal")
            .field("visited", &self.visited)
            .field("descent_depth", &self.descent.len())
            .finish_non_exhaustive()
    }
}

impl<'a, S: SegmentedStore + ?Sized, L: TraversalListener> TrieTraversal<'a, S, L> {
    /// A traversal over `store` reporting to `listener`.
    pub fn new(store: &'a S, listener: &'a mut L) -> Self {
        Self {
            store,
            listener,
            stop: None,
            visited: 0,
            descent: HashSet::new(),
        }
    }

    /// Cooperative cancellation: the walk checks `stop` at every node and
    /// returns [`TraversalError::Cancelled`] once it is raised.
    pub fn with_stop_flag(mut self, stop: &'a AtomicBool) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Walks the whole world state under `root`. Returns the number of nodes
    /// visited, storage tries and inline nodes included.
    pub fn traverse(mut self, root: H256) -> Result<u64, TraversalError> {
        self.listener.root(root);

        if root == EMPTY_TRIE_HASH {
            return Ok(self.visited);
        }

        let Some(raw) = self.store.get(Segment::AccountTrie, root.as_bytes())? else {
            self.listener.missing_value_for_node(root);
            return Ok(self.visited);
        };

        let found = node_hash(&raw);
        if found != root {
            self.listener
                .invalid_account_trie_for_hash(root, &Location::empty(), found);
            return Ok(self.visited);
        }

        self.descent.insert(root);
        self.visit_account_node(&raw, &Location::empty())?;
        self.descent.remove(&root);

        Ok(self.visited)
    }

    fn check_cancelled(&self) -> Result<(), TraversalError> {
        match self.stop {
            Some(stop) if stop.load(Ordering::Relaxed) => Err(TraversalError::Cancelled),
            _ => Ok(()),
        }
    }

    fn visit_account_node(
        &mut self,
        raw: &[u8],
        location: &Location,
    ) -> Result<(), TraversalError> {
        self.check_cancelled()?;
        self.visited += 1;
        self.listener.visited(TrieType::Account);

        let node = match decode_node(raw) {
            Ok(node) => node,
            Err(err) => {
                warn!("undecodable account trie node at {location}: {err}");
                return Ok(());
            }
        };

        match node {
            DecodedNode::Branch { children, value } => {
                for (nibble, child) in children.iter().enumerate() {
                    self.descend_account(child, location.child(nibble as u8))?;
                }
                if let Some(value) = value {
                    self.account_leaf(location, &value)?;
                }
            }
            DecodedNode::Extension { path, child } => {
                self.descend_account(&child, location.join(&path))?;
            }
            DecodedNode::Leaf { path, value } => {
                self.account_leaf(&location.join(&path), &value)?;
            }
        }
        Ok(())
    }

    fn descend_account(
        &mut self,
        child: &NodeHandle,
        location: Location,
    ) -> Result<(), TraversalError> {
        match child {
            NodeHandle::Empty => Ok(()),
            NodeHandle::Inline(raw) => self.visit_account_node(raw, &location),
            NodeHandle::Hash(hash) => {
                if self.descent.contains(hash) {
                    return Err(TraversalError::CycleDetected {
                        hash: *hash,
                        location,
                    });
                }

                let Some(raw) = self.store.get(Segment::AccountTrie, hash.as_bytes())? else {
                    self.listener.missing_account_trie_for_hash(*hash, &location);
                    return Ok(());
                };

                let found = node_hash(&raw);
                if found != *hash {
                    self.listener
                        .invalid_account_trie_for_hash(*hash, &location, found);
                    return Ok(());
                }

                self.descent.insert(*hash);
                self.visit_account_node(&raw, &location)?;
                self.descent.remove(hash);
                Ok(())
            }
        }
    }

    fn account_leaf(&mut self, location: &Location, payload: &[u8]) -> Result<(), TraversalError> {
        let Some(account_hash) = location.to_leaf_key() else {
            warn!("account leaf at {location} does not spell a 32-byte key");
            return Ok(());
        };

        let account = match AccountEntry::from_rlp_bytes(payload) {
            Ok(account) => account,
            Err(err) => {
                warn!("undecodable account payload for {account_hash:?}: {err}");
                return Ok(());
            }
        };

        self.listener.account_leaf(account_hash, payload);

        // The flat mirror must hold the exact leaf bytes.
        let flat = self.store.get(Segment::FlatAccounts, account_hash.as_bytes())?;
        if flat.as_deref() != Some(payload) {
            self.listener
                .different_data_in_flat_database_for_account(account_hash);
        }

        if account.has_code() {
            self.check_code(account_hash, account.code_hash)?;
        }

        if account.has_storage() {
            self.storage_trie(account_hash, account.storage_root)?;
        }
        Ok(())
    }

    fn check_code(&mut self, account_hash: H256, code_hash: H256) -> Result<(), TraversalError> {
        let Some(code) = self.store.get(Segment::Code, code_hash.as_bytes())? else {
            self.listener.missing_code_hash(code_hash, account_hash);
            return Ok(());
        };

        let found = keccak(&code);
        if found != code_hash {
            self.listener.invalid_code(account_hash, code_hash, found);
        }
        Ok(())
    }

    fn storage_trie(&mut self, account_hash: H256, root: H256) -> Result<(), TraversalError> {
        let Some(raw) = self.store.get(Segment::StorageTrie, root.as_bytes())? else {
            self.listener
                .missing_storage_trie_for_hash(root, &Location::empty());
            return Ok(());
        };

        let found = node_hash(&raw);
        if found != root {
            self.listener.invalid_storage_trie_for_hash(
                account_hash,
                root,
                &Location::empty(),
                found,
            );
            return Ok(());
        }

        self.descent.insert(root);
        self.visit_storage_node(account_hash, &raw, &Location::empty())?;
        self.descent.remove(&root);
        Ok(())
    }

    fn visit_storage_node(
        &mut self,
        account_hash: H256,
        raw: &[u8],
        location: &Location,
    ) -> Result<(), TraversalError> {
        self.check_cancelled()?;
        self.visited += 1;
        self.listener.visited(TrieType::Storage);

        let node = match decode_node(raw) {
            Ok(node) => node,
            Err(err) => {
                warn!("undecodable storage trie node of {account_hash:?} at {location}: {err}");
                return Ok(());
            }
        };

        match node {
            DecodedNode::Branch { children, value } => {
                for (nibble, child) in children.iter().enumerate() {
                    self.descend_storage(account_hash, child, location.child(nibble as u8))?;
                }
                if let Some(value) = value {
                    self.storage_leaf(account_hash, location, &value)?;
                }
            }
            DecodedNode::Extension { path, child } => {
                self.descend_storage(account_hash, &child, location.join(&path))?;
            }
            DecodedNode::Leaf { path, value } => {
                self.storage_leaf(account_hash, &location.join(&path), &value)?;
            }
        }
        Ok(())
    }

    fn descend_storage(
        &mut self,
        account_hash: H256,
        child: &NodeHandle,
        location: Location,
    ) -> Result<(), TraversalError> {
        match child {
            NodeHandle::Empty => Ok(()),
            NodeHandle::Inline(raw) => self.visit_storage_node(account_hash, raw, &location),
            NodeHandle::Hash(hash) => {
                if self.descent.contains(hash) {
                    return Err(TraversalError::CycleDetected {
                        hash: *hash,
                        location,
                    });
                }

                let Some(raw) = self.store.get(Segment::StorageTrie, hash.as_bytes())? else {
                    self.listener.missing_storage_trie_for_hash(*hash, &location);
                    return Ok(());
                };

                let found = node_hash(&raw);
                if found != *hash {
                    self.listener
                        .invalid_storage_trie_for_hash(account_hash, *hash, &location, found);
                    return Ok(());
                }

                self.descent.insert(*hash);
                self.visit_storage_node(account_hash, &raw, &location)?;
                self.descent.remove(hash);
                Ok(())
            }
        }
    }

    fn storage_leaf(
        &mut self,
        account_hash: H256,
        location: &Location,
        payload: &[u8],
    ) -> Result<(), TraversalError> {
        let Some(slot_hash) = location.to_leaf_key() else {
            warn!("storage leaf of {account_hash:?} at {location} does not spell a 32-byte key");
            return Ok(());
        };

        // The leaf payload is the rlp of the raw slot value; the flat mirror
        // stores the raw value itself.
        let value = match Rlp::new(payload).data() {
            Ok(value) => value,
            Err(err) => {
                warn!("undecodable storage payload for {account_hash:?}/{slot_hash:?}: {err}");
                return Ok(());
            }
        };

        self.listener.storage_leaf(account_hash, slot_hash, value);

        let flat = self
            .store
            .get(Segment::FlatStorage, &flat_storage_key(account_hash, slot_hash))?;
        if flat.as_deref() != Some(value) {
            self.listener
                .different_data_in_flat_database_for_storage(account_hash, slot_hash);
        }
        Ok(())
    }
}
