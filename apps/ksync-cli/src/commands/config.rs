use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::json;
use std::path::PathBuf;

use ksync_core::{config_schema_json, load_config, write_schema_file};

use super::util::print_json;

#[derive(Subcommand)]
pub enum ConfigCmd {
    /// Print the JSON schema for config files, or write it to --out
    Schema(SchemaArgs),
    /// Validate a config file and print the effective settings
    Check(CheckArgs),
}

#[derive(Args)]
pub struct SchemaArgs {
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
pub struct CheckArgs {
    path: PathBuf,
    /// Pretty-print JSON
    #[arg(long)]
    pretty: bool,
}

pub fn run(cmd: ConfigCmd) -> Result<()> {
    match cmd {
        ConfigCmd::Schema(args) => match args.out {
            Some(out) => {
                write_schema_file(&out)
                    .with_context(|| format!("failed to write {}", out.display()))?;
                println!("Wrote {}", out.display());
                Ok(())
            }
            None => print_json(&config_schema_json(), true),
        },
        ConfigCmd::Check(args) => {
            let cfg = load_config(&args.path)?;
            let effective = json!({
                "ok": true,
                "state_dir": cfg.state_dir().display().to_string(),
                "cache": cfg.cache_path().display().to_string(),
                "bus_capacity": cfg.bus_capacity(),
                "ingest_capacity": cfg.ingest_capacity(),
                "batch_max": cfg.batch_max(),
                "state_store": cfg.state_store(),
                "persist_stores": cfg.persist_stores(),
            });
            print_json(&effective, args.pretty)
        }
    }
}
