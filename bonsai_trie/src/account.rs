//! The account-trie leaf payload and the flat-database key schemes derived
//! from it.

use ethereum_types::{H256, U256};
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::node::{EMPTY_CODE_HASH, EMPTY_TRIE_HASH};

/// One account, as stored in an account-trie leaf and mirrored byte-for-byte
/// in the flat accounts segment under its address hash.
#[derive(Clone, Debug, Eq, Hash, PartialEq, RlpDecodable, RlpEncodable)]
pub struct AccountEntry {
    /// Transaction count.
    pub nonce: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Root of the account's storage trie, or the canonical empty-trie hash.
    pub storage_root: H256,
    /// Keccak of the account's code, or the canonical empty-code hash.
    pub code_hash: H256,
}

impl AccountEntry {
    /// An account with no code and no storage.
    pub fn basic(nonce: u64, balance: U256) -> Self {
        Self {
            nonce,
            balance,
            storage_root: EMPTY_TRIE_HASH,
            code_hash: EMPTY_CODE_HASH,
        }
    }

    /// `true` when the account carries code.
    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_CODE_HASH
    }

    /// `true` when the account has a non-empty storage trie.
    pub fn has_storage(&self) -> bool {
        self.storage_root != EMPTY_TRIE_HASH
    }

    /// The RLP encoding used both as the trie leaf payload and as the flat
    /// mirror value.
    pub fn to_rlp_bytes(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Decodes the trie leaf payload / flat mirror value.
    pub fn from_rlp_bytes(bytes: &[u8]) -> Result<Self, rlp::DecoderError> {
        rlp::decode(bytes)
    }
}

/// The flat-storage key for one slot: address hash ‖ slot hash.
pub fn flat_storage_key(account_hash: H256, slot_hash: H256) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(account_hash.as_bytes());
    key[32..].copy_from_slice(slot_hash.as_bytes());
    key
}
