//! Command-line driver for the disk-backed B+ tree.
//!
//! A thin shell around [`btree::BpTree`]'s public operations: it owns no
//! tree logic of its own, just argument parsing, opening the store, and
//! printing results.

use std::path::PathBuf;

use anyhow::Result;
use btree::{BpTree, DeleteOutcome, InsertOutcome, SearchOutcome};
use clap::{Parser, Subcommand};
use common::Config;

const DEFAULT_BLOCK_SIZE: usize = 4096;
const DEFAULT_CACHE_SIZE: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "bptree", about = "Disk-backed B+ tree store")]
struct Args {
    /// Path (without the `.boot` suffix) of the tree's data file.
    #[arg(long, default_value = "btree_store")]
    file: PathBuf,

    /// Page size in bytes; must divide the OS page size and the
    /// filesystem block size of the directory containing `--file`.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Maximum number of resident pages in the in-memory cache.
    #[arg(long, default_value_t = DEFAULT_CACHE_SIZE)]
    cache_size: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert a key/value pair.
    Insert { key: u32, value: u64 },
    /// Look up a key.
    Search { key: u32 },
    /// Remove a key.
    Delete { key: u32 },
    /// Dump the tree structure depth-first, for debugging.
    Visualize,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::builder()
        .file_name(args.file)
        .block_size(args.block_size)
        .cache_size(args.cache_size)
        .build();

    let mut tree = BpTree::open(config)?;

    match args.command {
        Command::Insert { key, value } => match tree.insert(key, value)? {
            InsertOutcome::Inserted => println!("ok"),
            InsertOutcome::Duplicate => println!("duplicate key {key}"),
        },
        Command::Search { key } => match tree.search(key)? {
            SearchOutcome::Found(value) => println!("{value}"),
            SearchOutcome::NotFound => println!("not found"),
        },
        Command::Delete { key } => match tree.delete(key)? {
            DeleteOutcome::Deleted => println!("ok"),
            DeleteOutcome::NotFound => println!("not found"),
        },
        Command::Visualize => {
            for line in tree.visualize()? {
                println!("{line}");
            }
        }
    }

    tree.close()?;
    Ok(())
}
