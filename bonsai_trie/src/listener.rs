//! The capability interface a traversal reports through, plus the stock
//! implementations: console output, `log`-routed output, and anomaly
//! counting.

use std::fmt::{self, Display};
use std::io::{self, Write};

use ethereum_types::H256;
use log::{error, info, warn};

use crate::location::Location;

/// Which trie a visited node belongs to.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum TrieType {
    /// The account trie.
    Account,
    /// A per-account storage trie.
    Storage,
}

impl TrieType {
    /// The single-character progress glyph for this trie kind.
    pub const fn glyph(&self) -> char {
        match self {
            TrieType::Account => '@',
            TrieType::Storage => '#',
        }
    }
}

/// Receives every event of a verification or conversion walk.
///
/// Anomaly callbacks are purely informational: the traversal never mutates
/// anything and never stops on their account. Implementations must accept
/// events in any order and any quantity.
pub trait TraversalListener {
    /// The root hash the walk starts from.
    fn root(&mut self, hash: H256);

    /// An account claims `code_hash` but the code segment has no such entry.
    fn missing_code_hash(&mut self, code_hash: H256, account_hash: H256);

    /// Code bytes exist but hash to `found` instead of `expected`.
    fn invalid_code(&mut self, account_hash: H256, expected: H256, found: H256);

    /// The root node itself has no bytes in the store.
    fn missing_value_for_node(&mut self, hash: H256);

    /// A node was visited. Called exactly once per visited node.
    fn visited(&mut self, trie_type: TrieType);

    /// An account-trie child reference resolved to nothing.
    fn missing_account_trie_for_hash(&mut self, hash: H256, location: &Location);

    /// Account-trie node bytes hash to `found` instead of the requested hash.
    fn invalid_account_trie_for_hash(&mut self, hash: H256, location: &Location, found: H256);

    /// A storage-trie child reference resolved to nothing.
    fn missing_storage_trie_for_hash(&mut self, hash: H256, location: &Location);

    /// Storage-trie node bytes hash to `found` instead of the requested
    /// hash, within the storage trie owned by `account_hash`.
    fn invalid_storage_trie_for_hash(
        &mut self,
        account_hash: H256,
        hash: H256,
        location: &Location,
        found: H256,
    );

    /// The flat accounts segment disagrees with (or lacks) the trie leaf.
    fn different_data_in_flat_database_for_account(&mut self, account_hash: H256);

    /// The flat storage segment disagrees with (or lacks) the trie leaf.
    fn different_data_in_flat_database_for_storage(&mut self, account_hash: H256, slot_hash: H256);

    /// Observation hook: an account leaf was decoded at `account_hash` with
    /// the given payload. Provided for conversion tooling; diagnostic
    /// listeners need not override it.
    fn account_leaf(&mut self, _account_hash: H256, _value: &[u8]) {}

    /// Observation hook: a storage leaf was decoded. See
    /// [`TraversalListener::account_leaf`].
    fn storage_leaf(&mut self, _account_hash: H256, _slot_hash: H256, _value: &[u8]) {}
}

/// A listener that ignores everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopListener;

impl TraversalListener for NoopListener {
    fn root(&mut self, _hash: H256) {}
    fn missing_code_hash(&mut self, _code_hash: H256, _account_hash: H256) {}
    fn invalid_code(&mut self, _account_hash: H256, _expected: H256, _found: H256) {}
    fn missing_value_for_node(&mut self, _hash: H256) {}
    fn visited(&mut self, _trie_type: TrieType) {}
    fn missing_account_trie_for_hash(&mut self, _hash: H256, _location: &Location) {}
    fn invalid_account_trie_for_hash(&mut self, _hash: H256, _location: &Location, _found: H256) {}
    fn missing_storage_trie_for_hash(&mut self, _hash: H256, _location: &Location) {}
    fn invalid_storage_trie_for_hash(
        &mut self,
        _account_hash: H256,
        _hash: H256,
        _location: &Location,
        _found: H256,
    ) {
    }
    fn different_data_in_flat_database_for_account(&mut self, _account_hash: H256) {}
    fn different_data_in_flat_database_for_storage(
        &mut self,
        _account_hash: H256,
        _slot_hash: H256,
    ) {
    }
}

/// Interactive console output: anomalies to stderr, a progress glyph to
/// stdout every 10k nodes and a running total every million.
#[derive(Clone, Debug, Default)]
pub struct ConsoleListener {
    visited: u64,
}

impl TraversalListener for ConsoleListener {
    fn root(&mut self, hash: H256) {
        eprintln!("Working with root {hash:?}");
    }

    fn missing_code_hash(&mut self, code_hash: H256, account_hash: H256) {
        eprintln!("missing code hash {code_hash:?} for account {account_hash:?}");
    }

    fn invalid_code(&mut self, account_hash: H256, expected: H256, found: H256) {
        eprintln!(
            "invalid code for account {account_hash:?} (expected {expected:?} and found {found:?})"
        );
    }

    fn missing_value_for_node(&mut self, hash: H256) {
        eprintln!("Missing value for node {hash:?}");
    }

    fn visited(&mut self, trie_type: TrieType) {
        self.visited += 1;
        if self.visited % 10_000 == 0 {
            print!("{}", trie_type.glyph());
            let _ = io::stdout().flush();
        }
        if self.visited % 1_000_000 == 0 {
            println!();
            println!("So far processed {} nodes", self.visited);
        }
    }

    fn missing_account_trie_for_hash(&mut self, hash: H256, location: &Location) {
        eprintln!("missing account trie node for hash {hash:?} and location {location}");
    }

    fn invalid_account_trie_for_hash(&mut self, hash: H256, location: &Location, found: H256) {
        eprintln!(
            "invalid account trie node for hash {hash:?} and location {location} (found {found:?})"
        );
    }

    fn missing_storage_trie_for_hash(&mut self, hash: H256, location: &Location) {
        eprintln!("missing storage trie node for hash {hash:?} and location {location}");
    }

    fn invalid_storage_trie_for_hash(
        &mut self,
        account_hash: H256,
        hash: H256,
        location: &Location,
        found: H256,
    ) {
        eprintln!(
            "invalid storage trie node for account {account_hash:?} hash {hash:?} and location \
             {location} (found {found:?})"
        );
    }

    fn different_data_in_flat_database_for_account(&mut self, account_hash: H256) {
        eprintln!("inconsistent data in flat database for account {account_hash:?}");
    }

    fn different_data_in_flat_database_for_storage(&mut self, account_hash: H256, slot_hash: H256) {
        eprintln!(
            "inconsistent data in flat database for account {account_hash:?} on slot {slot_hash:?}"
        );
    }
}

/// Routes every event through the `log` crate (the "log panel" variant).
#[derive(Clone, Debug, Default)]
pub struct LogListener;

impl TraversalListener for LogListener {
    fn root(&mut self, hash: H256) {
        info!("working with root {hash:?}");
    }

    fn missing_code_hash(&mut self, code_hash: H256, account_hash: H256) {
        error!("missing code hash {code_hash:?} for account {account_hash:?}");
    }

    fn invalid_code(&mut self, account_hash: H256, expected: H256, found: H256) {
        error!(
            "invalid code for account {account_hash:?} (expected {expected:?} and found {found:?})"
        );
    }

    fn missing_value_for_node(&mut self, hash: H256) {
        error!("missing value for node {hash:?}");
    }

    fn visited(&mut self, _trie_type: TrieType) {}

    fn missing_account_trie_for_hash(&mut self, hash: H256, location: &Location) {
        error!("missing account trie node for hash {hash:?} and location {location}");
    }

    fn invalid_account_trie_for_hash(&mut self, hash: H256, location: &Location, found: H256) {
        error!(
            "invalid account trie node for hash {hash:?} and location {location} (found {found:?})"
        );
    }

    fn missing_storage_trie_for_hash(&mut self, hash: H256, location: &Location) {
        error!("missing storage trie node for hash {hash:?} and location {location}");
    }

    fn invalid_storage_trie_for_hash(
        &mut self,
        account_hash: H256,
        hash: H256,
        location: &Location,
        found: H256,
    ) {
        error!(
            "invalid storage trie node for account {account_hash:?} hash {hash:?} and location \
             {location} (found {found:?})"
        );
    }

    fn different_data_in_flat_database_for_account(&mut self, account_hash: H256) {
        warn!("inconsistent data in flat database for account {account_hash:?}");
    }

    fn different_data_in_flat_database_for_storage(&mut self, account_hash: H256, slot_hash: H256) {
        warn!(
            "inconsistent data in flat database for account {account_hash:?} on slot {slot_hash:?}"
        );
    }
}

/// Per-kind anomaly counters.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct AnomalyCounts {
    /// `missing_value_for_node` events.
    pub missing_root_values: u64,
    /// `missing_account_trie_for_hash` events.
    pub missing_account_nodes: u64,
    /// `invalid_account_trie_for_hash` events.
    pub invalid_account_nodes: u64,
    /// `missing_storage_trie_for_hash` events.
    pub missing_storage_nodes: u64,
    /// `invalid_storage_trie_for_hash` events.
    pub invalid_storage_nodes: u64,
    /// `missing_code_hash` events.
    pub missing_code: u64,
    /// `invalid_code` events.
    pub invalid_code: u64,
    /// `different_data_in_flat_database_for_account` events.
    pub flat_account_mismatches: u64,
    /// `different_data_in_flat_database_for_storage` events.
    pub flat_storage_mismatches: u64,
}

impl AnomalyCounts {
    /// Total across every anomaly kind.
    pub fn total(&self) -> u64 {
        self.missing_root_values
            + self.missing_account_nodes
            + self.invalid_account_nodes
            + self.missing_storage_nodes
            + self.invalid_storage_nodes
            + self.missing_code
            + self.invalid_code
            + self.flat_account_mismatches
            + self.flat_storage_mismatches
    }
}

/// Counts visits and anomalies by kind, forwarding every event to an inner
/// listener.
#[derive(Clone, Debug, Default)]
pub struct CountingListener<L = NoopListener> {
    inner: L,
    counts: AnomalyCounts,
    visited_account: u64,
    visited_storage: u64,
}

impl<L: TraversalListener> CountingListener<L> {
    /// Wrap an inner listener.
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            counts: AnomalyCounts::default(),
            visited_account: 0,
            visited_storage: 0,
        }
    }

    /// The anomaly counters accumulated so far.
    pub fn counts(&self) -> &AnomalyCounts {
        &self.counts
    }

    /// Unwraps the inner listener.
    pub fn into_inner(self) -> L {
        self.inner
    }

    /// Total nodes visited across both trie kinds.
    pub fn visited(&self) -> u64 {
        self.visited_account + self.visited_storage
    }

    /// `true` when any anomaly was reported.
    pub fn has_anomalies(&self) -> bool {
        self.counts.total() > 0
    }

    /// A human-readable summary of anomaly counts by kind plus the visited
    /// totals.
    pub fn summary(&self) -> Summary<'_, L> {
        Summary(self)
    }
}

/// Display adapter for [`CountingListener::summary`].
#[derive(Debug)]
pub struct Summary<'a, L>(&'a CountingListener<L>);

impl<L: TraversalListener> Display for Summary<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.0.counts;
        writeln!(
            f,
            "visited {} nodes ({} account, {} storage)",
            self.0.visited(),
            self.0.visited_account,
            self.0.visited_storage
        )?;

        if c.total() == 0 {
            return write!(f, "no anomalies found");
        }

        writeln!(f, "{} anomalies:", c.total())?;
        for (label, count) in [
            ("missing root values", c.missing_root_values),
            ("missing account trie nodes", c.missing_account_nodes),
            ("invalid account trie nodes", c.invalid_account_nodes),
            ("missing storage trie nodes", c.missing_storage_nodes),
            ("invalid storage trie nodes", c.invalid_storage_nodes),
            ("missing code entries", c.missing_code),
            ("invalid code entries", c.invalid_code),
            ("flat account mismatches", c.flat_account_mismatches),
            ("flat storage mismatches", c.flat_storage_mismatches),
        ] {
            if count > 0 {
                writeln!(f, "  {label}: {count}")?;
            }
        }
        Ok(())
    }
}

impl<L: TraversalListener> TraversalListener for CountingListener<L> {
    fn root(&mut self, hash: H256) {
        self.inner.root(hash);
    }

    fn missing_code_hash(&mut self, code_hash: H256, account_hash: H256) {
        self.counts.missing_code += 1;
        self.inner.missing_code_hash(code_hash, account_hash);
    }

    fn invalid_code(&mut self, account_hash: H256, expected: H256, found: H256) {
        self.counts.invalid_code += 1;
        self.inner.invalid_code(account_hash, expected, found);
    }

    fn missing_value_for_node(&mut self, hash: H256) {
        self.counts.missing_root_values += 1;
        self.inner.missing_value_for_node(hash);
    }

    fn visited(&mut self, trie_type: TrieType) {
        match trie_type {
            TrieType::Account => self.visited_account += 1,
            TrieType::Storage => self.visited_storage += 1,
        }
        self.inner.visited(trie_type);
    }

    fn missing_account_trie_for_hash(&mut self, hash: H256, location: &Location) {
        self.counts.missing_account_nodes += 1;
        self.inner.missing_account_trie_for_hash(hash, location);
    }

    fn invalid_account_trie_for_hash(&mut self, hash: H256, location: &Location, found: H256) {
        self.counts.invalid_account_nodes += 1;
        self.inner
            .invalid_account_trie_for_hash(hash, location, found);
    }

    fn missing_storage_trie_for_hash(&mut self, hash: H256, location: &Location) {
        self.counts.missing_storage_nodes += 1;
        self.inner.missing_storage_trie_for_hash(hash, location);
    }

    fn invalid_storage_trie_for_hash(
        &mut self,
        account_hash: H256,
        hash: H256,
        location: &Location,
        found: H256,
    ) {
        self.counts.invalid_storage_nodes += 1;
        self.inner
            .invalid_storage_trie_for_hash(account_hash, hash, location, found);
    }

    fn different_data_in_flat_database_for_account(&mut self, account_hash: H256) {
        self.counts.flat_account_mismatches += 1;
        self.inner
            .different_data_in_flat_database_for_account(account_hash);
    }

    fn different_data_in_flat_database_for_storage(&mut self, account_hash: H256, slot_hash: H256) {
        self.counts.flat_storage_mismatches += 1;
        self.inner
            .different_data_in_flat_database_for_storage(account_hash, slot_hash);
    }

    fn account_leaf(&mut self, account_hash: H256, value: &[u8]) {
        self.inner.account_leaf(account_hash, value);
    }

    fn storage_leaf(&mut self, account_hash: H256, slot_hash: H256, value: &[u8]) {
        self.inner.storage_leaf(account_hash, slot_hash, value);
    }
}
