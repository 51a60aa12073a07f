//! Nibble paths identifying where a node sits within a trie.
//!
//! Unlike a full trie key type, a location only ever grows by one branch
//! nibble or one extension/leaf key piece at a time, so a plain
//! byte-per-nibble vector is all that is needed.

use std::fmt::{self, Display};

use ethereum_types::H256;

/// A variable-length nibble path from a trie root down to a node.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Location(Vec<u8>);

impl Location {
    /// The root location.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Number of nibbles in the path.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` for the root location.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw nibbles (each element is `0..16`).
    pub fn as_nibbles(&self) -> &[u8] {
        &self.0
    }

    /// The location of a branch child.
    pub fn child(&self, nibble: u8) -> Self {
        debug_assert!(nibble < 16);
        let mut nibbles = self.0.clone();
        nibbles.push(nibble);
        Self(nibbles)
    }

    /// The location reached by following an extension/leaf key piece.
    pub fn join(&self, piece: &[u8]) -> Self {
        let mut nibbles = self.0.clone();
        nibbles.extend_from_slice(piece);
        Self(nibbles)
    }

    /// Packs a full 64-nibble path back into the 32-byte key it spells out.
    ///
    /// Returns `None` when the path is not exactly 64 nibbles long, which at
    /// a leaf means the trie is malformed.
    pub fn to_leaf_key(&self) -> Option<H256> {
        if self.0.len() != 64 {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, pair) in self.0.chunks(2).enumerate() {
            bytes[i] = (pair[0] << 4) | pair[1];
        }
        Some(H256(bytes))
    }
}

impl From<&[u8]> for Location {
    fn from(nibbles: &[u8]) -> Self {
        Self(nibbles.to_vec())
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for nibble in &self.0 {
            write!(f, "{nibble:x}")?;
        }
        Ok(())
    }
}
