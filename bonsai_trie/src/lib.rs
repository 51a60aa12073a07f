//! Consistency verification and state-diff replay for a persisted
//! Merkle-Patricia "Bonsai" world state.
//!
//! The core of this crate is the [`traversal::TrieTraversal`] engine, which
//! walks the account trie and every reachable storage trie of a
//! [`seg_store::SegmentedStore`], cross-checking each node's content address
//! and each leaf's flat-database mirror. Anomalies are reported to a
//! [`listener::TraversalListener`] and the offending subtree is skipped;
//! the scan itself never stops on bad data.
//!
//! On top of the traversal sit:
//! - the per-block [`trie_log::TrieLogLayer`] diff format and its codec,
//! - the [`accumulator::WorldStateAccumulator`] with forward/backward layer
//!   application,
//! - the [`convert::DatabaseConverter`] migrating between the Bonsai and
//!   Forest physical layouts.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

pub mod account;
pub mod accumulator;
pub mod convert;
pub mod listener;
pub mod location;
pub mod node;
pub mod traversal;
pub mod trie_log;

#[cfg(test)]
pub(crate) mod testing_utils;
