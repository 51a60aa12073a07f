//! Per-block world-state diff layers and their wire codec.
//!
//! A [`TrieLogLayer`] records, for one block, every account, code and
//! storage-slot change as a prior/updated pair, which makes the layer
//! applicable in both directions: forward replays the block, backward rolls
//! it back.
//!
//! The encoding is explicit about absence: every optional value carries a
//! presence flag byte, so "no value existed" and "an empty value existed"
//! stay distinguishable. All counts and lengths are big-endian `u32`, maps
//! are written in key order, and decoding rejects trailing bytes, so
//! encode/decode is an exact round trip.

use std::collections::BTreeMap;

use ethereum_types::H256;
use seg_store::{Segment, SegmentedStore, StoreError};
use thiserror::Error;

use crate::account::AccountEntry;

/// A before/after pair for one item. `None` means the item did not exist on
/// that side of the block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Change<T> {
    /// The value before the block, if any.
    pub prior: Option<T>,
    /// The value after the block, if any.
    pub updated: Option<T>,
}

impl<T> Change<T> {
    /// A change from `prior` to `updated`.
    pub fn new(prior: Option<T>, updated: Option<T>) -> Self {
        Self { prior, updated }
    }
}

/// Every world-state change one block made.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrieLogLayer {
    /// The block this layer belongs to.
    pub block_hash: H256,
    /// Account changes, keyed by address hash.
    pub accounts: BTreeMap<H256, Change<AccountEntry>>,
    /// Code changes, keyed by address hash.
    pub code: BTreeMap<H256, Change<Vec<u8>>>,
    /// Storage changes, keyed by address hash then slot hash. Values are the
    /// raw slot bytes, as stored in the flat projection.
    pub storage: BTreeMap<H256, BTreeMap<H256, Change<Vec<u8>>>>,
}

impl TrieLogLayer {
    /// An empty layer for `block_hash`.
    pub fn new(block_hash: H256) -> Self {
        Self {
            block_hash,
            ..Self::default()
        }
    }

    /// Records an account change.
    pub fn add_account_change(
        &mut self,
        account_hash: H256,
        prior: Option<AccountEntry>,
        updated: Option<AccountEntry>,
    ) {
        self.accounts
            .insert(account_hash, Change::new(prior, updated));
    }

    /// Records a code change.
    pub fn add_code_change(
        &mut self,
        account_hash: H256,
        prior: Option<Vec<u8>>,
        updated: Option<Vec<u8>>,
    ) {
        self.code.insert(account_hash, Change::new(prior, updated));
    }

    /// Records a storage slot change.
    pub fn add_storage_change(
        &mut self,
        account_hash: H256,
        slot_hash: H256,
        prior: Option<Vec<u8>>,
        updated: Option<Vec<u8>>,
    ) {
        self.storage
            .entry(account_hash)
            .or_default()
            .insert(slot_hash, Change::new(prior, updated));
    }

    /// `true` when the layer records no changes at all.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.code.is_empty() && self.storage.is_empty()
    }

    /// Serializes the layer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.block_hash.as_bytes());

        write_u32(&mut out, self.accounts.len());
        for (account_hash, change) in &self.accounts {
            out.extend_from_slice(account_hash.as_bytes());
            write_option(&mut out, change.prior.as_ref().map(|a| a.to_rlp_bytes()));
            write_option(&mut out, change.updated.as_ref().map(|a| a.to_rlp_bytes()));
        }

        write_u32(&mut out, self.storage.len());
        for (account_hash, slots) in &self.storage {
            out.extend_from_slice(account_hash.as_bytes());
            write_u32(&mut out, slots.len());
            for (slot_hash, change) in slots {
                out.extend_from_slice(slot_hash.as_bytes());
                write_option(&mut out, change.prior.clone());
                write_option(&mut out, change.updated.clone());
            }
        }

        write_u32(&mut out, self.code.len());
        for (account_hash, change) in &self.code {
            out.extend_from_slice(account_hash.as_bytes());
            write_option(&mut out, change.prior.clone());
            write_option(&mut out, change.updated.clone());
        }

        out
    }

    /// Deserializes a layer, rejecting malformed and trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, TrieLogDecodeError> {
        let mut reader = Reader { bytes, offset: 0 };

        let block_hash = reader.h256("block hash")?;
        let mut layer = TrieLogLayer::new(block_hash);

        for _ in 0..reader.u32("account count")? {
            let account_hash = reader.h256("account address hash")?;
            let prior = reader
                .option("prior account")?
                .map(|b| decode_account(&b, &reader))
                .transpose()?;
            let updated = reader
                .option("updated account")?
                .map(|b| decode_account(&b, &reader))
                .transpose()?;
            layer.accounts.insert(account_hash, Change::new(prior, updated));
        }

        for _ in 0..reader.u32("storage account count")? {
            let account_hash = reader.h256("storage address hash")?;
            let mut slots = BTreeMap::new();
            for _ in 0..reader.u32("slot count")? {
                let slot_hash = reader.h256("slot hash")?;
                let prior = reader.option("prior slot value")?;
                let updated = reader.option("updated slot value")?;
                slots.insert(slot_hash, Change::new(prior, updated));
            }
            layer.storage.insert(account_hash, slots);
        }

        for _ in 0..reader.u32("code count")? {
            let account_hash = reader.h256("code address hash")?;
            let prior = reader.option("prior code")?;
            let updated = reader.option("updated code")?;
            layer.code.insert(account_hash, Change::new(prior, updated));
        }

        if reader.offset != bytes.len() {
            return Err(TrieLogDecodeError::TrailingBytes {
                offset: reader.offset,
                trailing: bytes.len() - reader.offset,
            });
        }

        Ok(layer)
    }
}

/// A malformed trie-log encoding. Every variant carries the byte offset at
/// which decoding failed.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TrieLogDecodeError {
    /// The input ended before a field was complete.
    #[error("trie log truncated at offset {offset} reading {field}: {expected} more bytes expected")]
    Truncated {
        /// Where the incomplete field starts.
        offset: usize,
        /// How many bytes the field still needed.
        expected: usize,
        /// Which wire field was being read.
        field: &'static str,
    },

    /// A presence flag byte was neither 0 nor 1.
    #[error("invalid presence flag {found:#04x} at offset {offset}")]
    InvalidPresenceFlag {
        /// Where the flag byte sits.
        offset: usize,
        /// The byte actually found.
        found: u8,
    },

    /// An account value did not decode as account rlp.
    #[error("bad account rlp ending at offset {offset}: {source}")]
    BadAccountRlp {
        /// End of the undecodable value.
        offset: usize,
        /// The rlp error.
        source: rlp::DecoderError,
    },

    /// Bytes remained after a complete layer.
    #[error("{trailing} trailing bytes after trie log at offset {offset}")]
    TrailingBytes {
        /// End of the decoded layer.
        offset: usize,
        /// Number of unconsumed bytes.
        trailing: usize,
    },
}

/// Failure to load a stored trie-log layer.
#[derive(Clone, Debug, Error)]
pub enum TrieLogReadError {
    /// The storage engine failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// No layer is stored for the block.
    #[error("no trie log stored for block {0:?}")]
    NotFound(H256),

    /// The stored bytes are malformed.
    #[error(transparent)]
    Decode(#[from] TrieLogDecodeError),
}

/// Loads and decodes the trie-log layer of `block_hash`.
pub fn read_trie_log<S: SegmentedStore + ?Sized>(
    store: &S,
    block_hash: H256,
) -> Result<TrieLogLayer, TrieLogReadError> {
    let bytes = store
        .get(Segment::TrieLog, block_hash.as_bytes())?
        .ok_or(TrieLogReadError::NotFound(block_hash))?;
    Ok(TrieLogLayer::decode(&bytes)?)
}

fn write_u32(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(&u32::try_from(n).expect("map size exceeds u32").to_be_bytes());
}

fn write_option(out: &mut Vec<u8>, value: Option<Vec<u8>>) {
    match value {
        None => out.push(0),
        Some(bytes) => {
            out.push(1);
            write_u32(out, bytes.len());
            out.extend_from_slice(&bytes);
        }
    }
}

fn decode_account(bytes: &[u8], reader: &Reader<'_>) -> Result<AccountEntry, TrieLogDecodeError> {
    AccountEntry::from_rlp_bytes(bytes).map_err(|source| TrieLogDecodeError::BadAccountRlp {
        offset: reader.offset,
        source,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize, field: &'static str) -> Result<&[u8], TrieLogDecodeError> {
        let remaining = self.bytes.len() - self.offset;
        if remaining < n {
            return Err(TrieLogDecodeError::Truncated {
                offset: self.offset,
                expected: n - remaining,
                field,
            });
        }
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, TrieLogDecodeError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn h256(&mut self, field: &'static str) -> Result<H256, TrieLogDecodeError> {
        Ok(H256::from_slice(self.take(32, field)?))
    }

    fn option(&mut self, field: &'static str) -> Result<Option<Vec<u8>>, TrieLogDecodeError> {
        let flag_offset = self.offset;
        match self.take(1, field)?[0] {
            0 => Ok(None),
            1 => {
                let len = self.u32(field)? as usize;
                Ok(Some(self.take(len, field)?.to_vec()))
            }
            found => Err(TrieLogDecodeError::InvalidPresenceFlag {
                offset: flag_offset,
                found,
            }),
        }
    }
}
