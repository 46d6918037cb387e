use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

use commands::{CacheCmd, ConfigCmd, PathsArgs, StoreCmd, SyncCmd};

#[derive(Parser)]
#[command(name = "ksync", version, about = "Kernel event sync utilities")]
struct Cli {
    /// Config file (TOML); defaults apply when omitted
    #[arg(long, global = true, env = "KSYNC_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print effective state and cache paths (JSON)
    Paths(PathsArgs),
    /// Config schema and validation
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Inspect or edit the durable cache
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
    /// Feed events through the sync manager
    Sync {
        #[command(subcommand)]
        cmd: SyncCmd,
    },
    /// Inspect persisted reactive stores
    Store {
        #[command(subcommand)]
        cmd: StoreCmd,
    },
}

fn main() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = commands::util::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Paths(args) => commands::paths::run(&config, cli.config.as_deref(), args),
        Commands::Config { cmd } => commands::config::run(cmd),
        Commands::Cache { cmd } => commands::cache::run(&config, cmd),
        Commands::Sync { cmd } => commands::sync::run(&config, cmd),
        Commands::Store { cmd } => commands::store::run(&config, cmd),
    }
}
