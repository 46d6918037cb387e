use anyhow::{Context, Result};
use serde::Serialize;
use std::future::Future;
use std::path::Path;

use ksync_core::{load_config, Config};
use ksync_kernel::SqliteCache;

pub fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

pub fn open_cache(config: &Config) -> Result<SqliteCache> {
    let path = config.cache_path();
    SqliteCache::open_path(&path)
        .with_context(|| format!("failed to open cache {}", path.display()))
}

pub fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(rt.block_on(fut))
}

pub fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}
