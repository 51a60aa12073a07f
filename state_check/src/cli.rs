use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ethereum_types::H256;

/// World-state database checker and converter.
#[derive(Debug, Parser)]
#[command(name = "state_check", version, about)]
pub(crate) struct Cli {
    /// Path to the RocksDB data directory.
    #[arg(long, env = "STATE_CHECK_DB")]
    pub(crate) db_path: PathBuf,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Walk every trie under a state root, cross-checking node hashes, code
    /// and the flat projections. Exits non-zero when anomalies were found.
    Verify {
        /// The state root to start from.
        #[arg(long, value_parser = parse_h256)]
        state_root: H256,
    },

    /// Convert the database between the forest and bonsai layouts.
    Convert {
        #[command(subcommand)]
        direction: Direction,
    },

    /// Decode and print the trie-log layer stored for one block.
    TrieLog {
        /// The block hash the layer is stored under.
        #[arg(value_parser = parse_h256)]
        block_hash: H256,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum Direction {
    /// Rebuild the flat projections from the tries.
    ToBonsai {
        /// The state root to rebuild from.
        #[arg(long, value_parser = parse_h256)]
        state_root: H256,
    },

    /// Verify the tries, then drop the flat projections.
    ToForest {
        /// The state root to verify before dropping.
        #[arg(long, value_parser = parse_h256)]
        state_root: H256,
    },
}

pub(crate) fn parse_h256(s: &str) -> Result<H256, String> {
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(hex_str).map_err(|e| format!("not a hex string: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("expected 32 bytes, got {}", bytes.len()));
    }
    Ok(H256::from_slice(&bytes))
}
