use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use serde_json::Value;

use ksync_core::Config;
use ksync_kernel::CacheStore;

use super::util::{block_on, open_cache, print_json};

#[derive(Subcommand)]
pub enum CacheCmd {
    /// Print one entry
    Get(GetArgs),
    /// Write a JSON value
    Put(PutArgs),
    /// List entries by id, or by recency with --recent
    List(ListArgs),
    /// Delete one entry
    Rm(RmArgs),
}

#[derive(Args)]
pub struct GetArgs {
    id: String,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
pub struct PutArgs {
    id: String,
    /// JSON value
    data: String,
    /// Entry timestamp in ms (defaults to now)
    #[arg(long)]
    ts: Option<u64>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Only ids starting with this prefix
    #[arg(long)]
    prefix: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Newest first instead of by id (ignores --prefix)
    #[arg(long)]
    recent: bool,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args)]
pub struct RmArgs {
    id: String,
}

pub fn run(config: &Config, cmd: CacheCmd) -> Result<()> {
    let cache = open_cache(config)?;
    match cmd {
        CacheCmd::Get(args) => {
            let entry = block_on(cache.get(&args.id))??
                .ok_or_else(|| anyhow!("no cache entry '{}'", args.id))?;
            print_json(&entry, args.pretty)
        }
        CacheCmd::Put(args) => {
            let data: Value = serde_json::from_str(&args.data)
                .with_context(|| format!("invalid JSON for '{}'", args.id))?;
            let entry = block_on(cache.put(&args.id, data, args.ts))??;
            print_json(&entry, false)
        }
        CacheCmd::List(args) => {
            let entries = if args.recent {
                block_on(cache.recent(args.limit))??
            } else {
                block_on(cache.list(args.prefix.as_deref(), args.limit))??
            };
            print_json(&entries, args.pretty)
        }
        CacheCmd::Rm(args) => {
            if block_on(cache.delete(&args.id))?? {
                println!("Removed {}", args.id);
                Ok(())
            } else {
                Err(anyhow!("no cache entry '{}'", args.id))
            }
        }
    }
}
