//! Fixture helpers for building real, hash-linked tries inside a
//! [`MemorySegmentedStore`].
//!
//! The builders here write canonical node encodings (hex-prefix key pieces,
//! inline embedding below 32 bytes) so the traversal under test exercises the
//! same byte formats a production database holds.

use ethereum_types::{H256, U256};
use keccak_hash::keccak;
use rlp::RlpStream;
use seg_store::{MemorySegmentedStore, Segment, SegmentedStore, StoreTransaction};

use crate::account::{flat_storage_key, AccountEntry};
use crate::node::{encode_hex_prefix, EMPTY_CODE_HASH, EMPTY_TRIE_HASH};

pub(crate) fn key_nibbles(key: H256) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(64);
    for byte in key.as_bytes() {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

/// Builds a trie over 32-byte keys and writes every node encoding of 32
/// bytes or more to `segment`, keyed by its keccak. Returns the root hash
/// and the total node count, inline nodes included.
pub(crate) fn build_trie(
    store: &MemorySegmentedStore,
    segment: Segment,
    entries: &[(H256, Vec<u8>)],
) -> (H256, u64) {
    if entries.is_empty() {
        return (EMPTY_TRIE_HASH, 0);
    }

    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = entries
        .iter()
        .map(|(key, value)| (key_nibbles(*key), value.clone()))
        .collect();
    entries.sort();

    let mut tx = store.begin_transaction().unwrap();
    let mut count = 0;
    let root_raw = build_node(tx.as_mut(), segment, &entries, 0, &mut count);

    // The root is always fetched by hash, never inline.
    let root = keccak(&root_raw);
    tx.put(segment, root.as_bytes(), &root_raw).unwrap();
    tx.commit().unwrap();

    (root, count)
}

fn build_node(
    tx: &mut dyn StoreTransaction,
    segment: Segment,
    entries: &[(Vec<u8>, Vec<u8>)],
    depth: usize,
    count: &mut u64,
) -> Vec<u8> {
    *count += 1;

    if let [(nibbles, value)] = entries {
        let mut stream = RlpStream::new_list(2);
        stream.append(&encode_hex_prefix(&nibbles[depth..], true));
        stream.append(&value.as_slice());
        return stream.out().to_vec();
    }

    // Longest nibble run shared by every entry past `depth`.
    let first = &entries[0].0;
    let mut shared = first.len() - depth;
    for (nibbles, _) in &entries[1..] {
        let common = nibbles[depth..]
            .iter()
            .zip(&first[depth..])
            .take_while(|(a, b)| a == b)
            .count();
        shared = shared.min(common);
    }

    if shared > 0 {
        let branch = build_branch(tx, segment, entries, depth + shared, count);
        let mut stream = RlpStream::new_list(2);
        stream.append(&encode_hex_prefix(&first[depth..depth + shared], false));
        append_child(&mut stream, tx, segment, &branch);
        stream.out().to_vec()
    } else {
        // No count bump here; build_branch already did it for this node.
        *count -= 1;
        build_branch(tx, segment, entries, depth, count)
    }
}

fn build_branch(
    tx: &mut dyn StoreTransaction,
    segment: Segment,
    entries: &[(Vec<u8>, Vec<u8>)],
    depth: usize,
    count: &mut u64,
) -> Vec<u8> {
    *count += 1;

    let mut stream = RlpStream::new_list(17);
    let mut rest = entries;
    for nibble in 0u8..16 {
        let split = rest
            .iter()
            .position(|(nibbles, _)| nibbles[depth] != nibble)
            .unwrap_or(rest.len());
        let (group, remainder) = rest.split_at(split);
        rest = remainder;

        if group.is_empty() {
            stream.append_empty_data();
        } else {
            let child = build_node(tx, segment, group, depth + 1, count);
            append_child(&mut stream, tx, segment, &child);
        }
    }
    stream.append_empty_data();
    stream.out().to_vec()
}

fn append_child(
    stream: &mut RlpStream,
    tx: &mut dyn StoreTransaction,
    segment: Segment,
    raw: &[u8],
) {
    if raw.len() >= 32 {
        let hash = keccak(raw);
        tx.put(segment, hash.as_bytes(), raw).unwrap();
        stream.append(&hash.as_bytes());
    } else {
        stream.append_raw(raw, 1);
    }
}

/// One account's worth of fixture state.
pub(crate) struct SeededAccount {
    pub hash: H256,
    pub nonce: u64,
    pub balance: U256,
    pub code: Option<Vec<u8>>,
    /// Slot hash to raw (unencoded) slot value.
    pub storage: Vec<(H256, Vec<u8>)>,
}

impl SeededAccount {
    pub(crate) fn basic(hash: H256, nonce: u64) -> Self {
        Self {
            hash,
            nonce,
            balance: U256::from(1_000u64) * nonce,
            code: None,
            storage: Vec::new(),
        }
    }
}

/// Seeds a fully consistent world state: per-account storage tries, code,
/// both flat projections, and the account trie over it all. Returns the
/// state root and the total node count across every trie.
pub(crate) fn seed_world(store: &MemorySegmentedStore, accounts: &[SeededAccount]) -> (H256, u64) {
    let mut total_nodes = 0;
    let mut account_entries = Vec::with_capacity(accounts.len());
    let mut tx = store.begin_transaction().unwrap();

    for account in accounts {
        let code_hash = match &account.code {
            Some(code) => {
                let hash = keccak(code);
                tx.put(Segment::Code, hash.as_bytes(), code).unwrap();
                hash
            }
            None => EMPTY_CODE_HASH,
        };

        let storage_entries: Vec<(H256, Vec<u8>)> = account
            .storage
            .iter()
            .map(|(slot, value)| (*slot, rlp::encode(&value.as_slice()).to_vec()))
            .collect();
        let (storage_root, storage_nodes) =
            build_trie(store, Segment::StorageTrie, &storage_entries);
        total_nodes += storage_nodes;

        for (slot, value) in &account.storage {
            tx.put(
                Segment::FlatStorage,
                &flat_storage_key(account.hash, *slot),
                value,
            )
            .unwrap();
        }

        let entry = AccountEntry {
            nonce: account.nonce,
            balance: account.balance,
            storage_root,
            code_hash,
        };
        let payload = entry.to_rlp_bytes();
        tx.put(Segment::FlatAccounts, account.hash.as_bytes(), &payload)
            .unwrap();
        account_entries.push((account.hash, payload));
    }
    tx.commit().unwrap();

    let (root, account_nodes) = build_trie(store, Segment::AccountTrie, &account_entries);
    total_nodes += account_nodes;
    (root, total_nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{decode_node, DecodedNode};

    #[test]
    fn single_entry_trie_is_one_stored_leaf() {
        let store = MemorySegmentedStore::new();
        let key = H256::repeat_byte(0x5a);
        let (root, count) =
            build_trie(&store, Segment::AccountTrie, &[(key, b"value".to_vec())]);

        assert_eq!(count, 1);
        let raw = store
            .get(Segment::AccountTrie, root.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(keccak(&raw), root);
        match decode_node(&raw).unwrap() {
            DecodedNode::Leaf { path, value } => {
                assert_eq!(path, key_nibbles(key));
                assert_eq!(value, b"value");
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn diverging_keys_produce_a_branch() {
        let store = MemorySegmentedStore::new();
        let (root, count) = build_trie(
            &store,
            Segment::AccountTrie,
            &[
                (H256::repeat_byte(0x11), b"one".to_vec()),
                (H256::repeat_byte(0x22), b"two".to_vec()),
            ],
        );

        // One branch plus two leaves.
        assert_eq!(count, 3);
        let raw = store
            .get(Segment::AccountTrie, root.as_bytes())
            .unwrap()
            .unwrap();
        assert!(matches!(
            decode_node(&raw).unwrap(),
            DecodedNode::Branch { .. }
        ));
    }
}
