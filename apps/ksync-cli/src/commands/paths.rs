use anyhow::Result;
use clap::Args;
use serde_json::json;
use std::path::Path;

use ksync_core::Config;

use super::util::print_json;

#[derive(Args)]
pub struct PathsArgs {
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

pub fn run(config: &Config, config_path: Option<&Path>, args: PathsArgs) -> Result<()> {
    let v = json!({
        "config": config_path.map(|p| p.display().to_string()),
        "state_dir": config.state_dir().display().to_string(),
        "cache": config.cache_path().display().to_string(),
        "state_store": config.state_store(),
    });
    print_json(&v, args.pretty)
}
