use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};

use ksync_core::Config;
use ksync_kernel::CacheStore;

use super::util::{block_on, open_cache, print_json};

#[derive(Subcommand)]
pub enum StoreCmd {
    /// Print the persisted value of a store
    Show(ShowArgs),
}

#[derive(Args)]
pub struct ShowArgs {
    /// Store name (or custom persistence key)
    name: String,
    #[arg(long)]
    pretty: bool,
}

pub fn run(config: &Config, cmd: StoreCmd) -> Result<()> {
    match cmd {
        StoreCmd::Show(args) => {
            let cache = open_cache(config)?;
            let entry = block_on(cache.get(&args.name))??
                .ok_or_else(|| anyhow!("store '{}' has no persisted value", args.name))?;
            print_json(&entry.data, args.pretty)
        }
    }
}
