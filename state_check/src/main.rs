//! Command-line front end for world-state verification, layout conversion
//! and trie-log inspection.

use anyhow::Context;
use bonsai_trie::convert::DatabaseConverter;
use bonsai_trie::listener::{ConsoleListener, CountingListener};
use bonsai_trie::traversal::TrieTraversal;
use bonsai_trie::trie_log::{read_trie_log, TrieLogLayer};
use clap::Parser;
use seg_store::RocksSegmentedStore;

mod cli;

use cli::{Cli, Command, Direction};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let store = RocksSegmentedStore::open(&cli.db_path)
        .with_context(|| format!("opening database at {}", cli.db_path.display()))?;

    match cli.command {
        Command::Verify { state_root } => {
            let mut listener = CountingListener::new(ConsoleListener::default());
            TrieTraversal::new(&store, &mut listener)
                .traverse(state_root)
                .context("traversal aborted")?;

            println!();
            println!("{}", listener.summary());
            if listener.has_anomalies() {
                std::process::exit(1);
            }
        }

        Command::Convert { direction } => {
            let converter = DatabaseConverter::new(&store);
            let mut listener = CountingListener::new(ConsoleListener::default());

            let report = match direction {
                Direction::ToBonsai { state_root } => converter
                    .convert_to_bonsai(state_root, &mut listener)
                    .context("conversion to bonsai failed")?,
                Direction::ToForest { state_root } => converter
                    .convert_to_forest(state_root, &mut listener)
                    .context("conversion to forest failed")?,
            };

            println!();
            println!(
                "converted: {} nodes visited, {} flat entries written",
                report.visited, report.entries_written
            );
            println!("{}", listener.summary());
            if listener.has_anomalies() {
                std::process::exit(1);
            }
        }

        Command::TrieLog { block_hash } => {
            let layer = read_trie_log(&store, block_hash)
                .with_context(|| format!("loading trie log for block {block_hash:?}"))?;
            print_layer(&layer);
        }
    }

    Ok(())
}

fn print_layer(layer: &TrieLogLayer) {
    println!("trie log for block {:?}", layer.block_hash);

    if layer.is_empty() {
        println!("  (no changes)");
        return;
    }

    for (account_hash, change) in &layer.accounts {
        println!("  account {account_hash:?}");
        match &change.prior {
            Some(prior) => println!(
                "    prior:   nonce {} balance {} storage_root {:?} code_hash {:?}",
                prior.nonce, prior.balance, prior.storage_root, prior.code_hash
            ),
            None => println!("    prior:   (absent)"),
        }
        match &change.updated {
            Some(updated) => println!(
                "    updated: nonce {} balance {} storage_root {:?} code_hash {:?}",
                updated.nonce, updated.balance, updated.storage_root, updated.code_hash
            ),
            None => println!("    updated: (absent)"),
        }
    }

    for (account_hash, change) in &layer.code {
        println!("  code for account {account_hash:?}");
        println!("    prior:   {}", format_bytes(change.prior.as_deref()));
        println!("    updated: {}", format_bytes(change.updated.as_deref()));
    }

    for (account_hash, slots) in &layer.storage {
        println!("  storage of account {account_hash:?}");
        for (slot_hash, change) in slots {
            println!("    slot {slot_hash:?}");
            println!("      prior:   {}", format_bytes(change.prior.as_deref()));
            println!("      updated: {}", format_bytes(change.updated.as_deref()));
        }
    }
}

fn format_bytes(bytes: Option<&[u8]>) -> String {
    match bytes {
        None => "(absent)".to_string(),
        Some([]) => "(empty)".to_string(),
        Some(bytes) => format!("0x{} ({} bytes)", hex::encode(bytes), bytes.len()),
    }
}
