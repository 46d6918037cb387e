use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use ksync_core::{Config, EventKernel, KernelEvent, KernelOptions};

use super::util::{block_on, open_cache, print_json};

#[derive(Subcommand)]
pub enum SyncCmd {
    /// Apply events from a JSON Lines file as one batch and print the result
    Replay(ReplayArgs),
}

#[derive(Args)]
pub struct ReplayArgs {
    /// One KernelEvent JSON object per line
    file: PathBuf,
    #[arg(long)]
    pretty: bool,
}

pub fn run(config: &Config, cmd: SyncCmd) -> Result<()> {
    match cmd {
        SyncCmd::Replay(args) => {
            let events = read_events(&args.file)?;
            debug!(count = events.len(), file = %args.file.display(), "replaying events");
            let cache = Arc::new(open_cache(config)?);
            let options = KernelOptions::from_config(config);
            let result = block_on(async move {
                let kernel = EventKernel::with_cache(cache, options).await?;
                let result = kernel.sync(events).await;
                kernel.shutdown().await?;
                Ok::<_, ksync_core::KernelError>(result)
            })??;
            print_json(&result, args.pretty)
        }
    }
}

fn read_events(path: &Path) -> Result<Vec<KernelEvent>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut events = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: KernelEvent = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid event", path.display(), idx + 1))?;
        events.push(event);
    }
    Ok(events)
}
