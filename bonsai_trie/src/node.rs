//! The node-codec bridge: turning raw, content-addressed node bytes into
//! just enough structure for a traversal (child references and leaf
//! payloads). Everything else about node semantics stays with the writer
//! that produced the trie.

use enum_as_inner::EnumAsInner;
use ethereum_types::H256;
use keccak_hash::keccak;
use rlp::Rlp;
use thiserror::Error;

/// Hash of the empty trie (`keccak(rlp(""))`), shared across
/// implementations to short-circuit empty subtrees.
pub const EMPTY_TRIE_HASH: H256 = keccak_hash::KECCAK_NULL_RLP;

/// Hash of empty code (`keccak([])`).
pub const EMPTY_CODE_HASH: H256 = keccak_hash::KECCAK_EMPTY;

/// Re-derives the content address of raw node bytes.
pub fn node_hash(bytes: &[u8]) -> H256 {
    keccak(bytes)
}

/// A reference to a child node as it appears inside a parent's encoding.
#[derive(Clone, Debug, EnumAsInner, Eq, Hash, PartialEq)]
pub enum NodeHandle {
    /// No child at this position.
    Empty,
    /// A child stored separately, addressed by the keccak of its encoding.
    Hash(H256),
    /// A child whose encoding is shorter than 32 bytes and therefore lives
    /// inline in its parent.
    Inline(Vec<u8>),
}

/// The structure a traversal needs out of one decoded node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum DecodedNode {
    /// 16 children plus an optional value.
    Branch {
        /// The children, in canonical nibble order.
        children: Box<[NodeHandle; 16]>,
        /// The branch payload, if any.
        value: Option<Vec<u8>>,
    },
    /// A shared key piece with a single child.
    Extension {
        /// The key piece, as nibbles.
        path: Vec<u8>,
        /// The child below the extension.
        child: NodeHandle,
    },
    /// A terminal key piece with a payload.
    Leaf {
        /// The key piece, as nibbles.
        path: Vec<u8>,
        /// The leaf payload.
        value: Vec<u8>,
    },
}

/// An error decoding raw node bytes.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum NodeDecodeError {
    /// The bytes are not valid RLP.
    #[error("invalid node rlp: {0}")]
    Rlp(#[from] rlp::DecoderError),

    /// The RLP list had neither 2 (extension/leaf) nor 17 (branch) items.
    #[error("node rlp list has {0} items, expected 2 or 17")]
    UnexpectedItemCount(usize),

    /// A child reference was a data item of a length other than 0 or 32.
    #[error("child reference of {0} bytes, expected an empty item or a 32-byte hash")]
    InvalidChildReference(usize),

    /// The hex-prefix key piece was empty or carried an unknown flag.
    #[error("invalid hex-prefix key piece")]
    InvalidHexPrefix,
}

/// Decodes raw node bytes into child handles and payloads.
pub fn decode_node(bytes: &[u8]) -> Result<DecodedNode, NodeDecodeError> {
    let rlp = Rlp::new(bytes);

    match rlp.item_count()? {
        17 => {
            let mut children: Box<[NodeHandle; 16]> =
                Box::new(std::array::from_fn(|_| NodeHandle::Empty));
            for (i, slot) in children.iter_mut().enumerate() {
                *slot = decode_child(&rlp.at(i)?)?;
            }

            let value = rlp.at(16)?.data()?;
            let value = (!value.is_empty()).then(|| value.to_vec());

            Ok(DecodedNode::Branch { children, value })
        }
        2 => {
            let (path, is_leaf) = decode_hex_prefix(rlp.at(0)?.data()?)?;

            if is_leaf {
                Ok(DecodedNode::Leaf {
                    path,
                    value: rlp.at(1)?.data()?.to_vec(),
                })
            } else {
                Ok(DecodedNode::Extension {
                    path,
                    child: decode_child(&rlp.at(1)?)?,
                })
            }
        }
        n => Err(NodeDecodeError::UnexpectedItemCount(n)),
    }
}

fn decode_child(item: &Rlp<'_>) -> Result<NodeHandle, NodeDecodeError> {
    if item.is_data() {
        let data = item.data()?;
        match data.len() {
            0 => Ok(NodeHandle::Empty),
            32 => Ok(NodeHandle::Hash(H256::from_slice(data))),
            n => Err(NodeDecodeError::InvalidChildReference(n)),
        }
    } else {
        // A nested list is an inline node (encoding < 32 bytes).
        Ok(NodeHandle::Inline(item.as_raw().to_vec()))
    }
}

/// Decodes a hex-prefix (compact) encoded key piece. Returns the nibbles
/// and whether the node is a leaf.
pub fn decode_hex_prefix(encoded: &[u8]) -> Result<(Vec<u8>, bool), NodeDecodeError> {
    let first = *encoded.first().ok_or(NodeDecodeError::InvalidHexPrefix)?;
    let flag = first >> 4;
    if flag > 3 {
        return Err(NodeDecodeError::InvalidHexPrefix);
    }

    let is_leaf = flag & 2 != 0;
    let is_odd = flag & 1 != 0;

    let mut nibbles = Vec::with_capacity(encoded.len() * 2);
    if is_odd {
        nibbles.push(first & 0x0f);
    }
    for byte in &encoded[1..] {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }

    Ok((nibbles, is_leaf))
}

/// Hex-prefix (compact) encodes a key piece.
pub fn encode_hex_prefix(nibbles: &[u8], is_leaf: bool) -> Vec<u8> {
    let mut flag = if is_leaf { 2u8 } else { 0 };
    let mut out = Vec::with_capacity(nibbles.len() / 2 + 1);

    let rest = if nibbles.len() % 2 == 1 {
        flag |= 1;
        out.push((flag << 4) | nibbles[0]);
        &nibbles[1..]
    } else {
        out.push(flag << 4);
        nibbles
    };

    for pair in rest.chunks(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
    out
}

#[cfg(test)]
mod tests {
    use rlp::RlpStream;

    use super::*;

    #[test]
    fn empty_trie_hash_matches_keccak_of_null_rlp() {
        assert_eq!(node_hash(&rlp::NULL_RLP), EMPTY_TRIE_HASH);
    }

    #[test]
    fn hex_prefix_round_trips() {
        for (nibbles, is_leaf) in [
            (vec![], false),
            (vec![0x1], true),
            (vec![0x1, 0x2], false),
            (vec![0xf, 0x0, 0xa], true),
            (vec![0x0, 0x1, 0x2, 0x3], true),
        ] {
            let encoded = encode_hex_prefix(&nibbles, is_leaf);
            assert_eq!(decode_hex_prefix(&encoded).unwrap(), (nibbles, is_leaf));
        }
    }

    #[test]
    fn decodes_leaf_node() {
        let mut stream = RlpStream::new_list(2);
        stream.append(&encode_hex_prefix(&[0xa, 0xb], true));
        stream.append(&b"payload".to_vec());

        let node = decode_node(&stream.out()).unwrap();
        assert_eq!(
            node,
            DecodedNode::Leaf {
                path: vec![0xa, 0xb],
                value: b"payload".to_vec()
            }
        );
    }

    #[test]
    fn decodes_extension_with_hash_child() {
        let child = H256::repeat_byte(0x42);

        let mut stream = RlpStream::new_list(2);
        stream.append(&encode_hex_prefix(&[0x1], false));
        stream.append(&child.as_bytes());

        let node = decode_node(&stream.out()).unwrap();
        assert_eq!(
            node,
            DecodedNode::Extension {
                path: vec![0x1],
                child: NodeHandle::Hash(child)
            }
        );
    }

    #[test]
    fn decodes_branch_children_in_canonical_order() {
        let child = H256::repeat_byte(0x11);

        let mut stream = RlpStream::new_list(17);
        stream.append(&child.as_bytes());
        for _ in 1..16 {
            stream.append_empty_data();
        }
        stream.append_empty_data();

        match decode_node(&stream.out()).unwrap() {
            DecodedNode::Branch { children, value } => {
                assert_eq!(children[0], NodeHandle::Hash(child));
                assert!(children[1..].iter().all(|c| *c == NodeHandle::Empty));
                assert_eq!(value, None);
            }
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn inline_children_are_surfaced_raw() {
        // A small leaf, inline-embedded in a branch.
        let mut leaf = RlpStream::new_list(2);
        leaf.append(&encode_hex_prefix(&[0x7], true));
        leaf.append(&b"v".to_vec());
        let leaf_raw = leaf.out().to_vec();
        assert!(leaf_raw.len() < 32);

        let mut stream = RlpStream::new_list(17);
        stream.append_raw(&leaf_raw, 1);
        for _ in 1..16 {
            stream.append_empty_data();
        }
        stream.append_empty_data();

        match decode_node(&stream.out()).unwrap() {
            DecodedNode::Branch { children, .. } => {
                assert_eq!(children[0], NodeHandle::Inline(leaf_raw));
            }
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode_node(&[0xc0]).is_err()); // empty list
        assert!(decode_node(b"not rlp at all \xff\xff").is_err());
    }
}
