use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_BUS_CAPACITY: usize = 1024;
pub const DEFAULT_INGEST_CAPACITY: usize = 1024;
pub const DEFAULT_BATCH_MAX: usize = 256;
pub const DEFAULT_STATE_STORE: &str = "ksync.synced";

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RuntimeConfig {
    /// Directory holding the durable cache (defaults to the per-user data dir)
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Cache database file name inside `state_dir`
    #[serde(default)]
    pub cache_file: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct BusConfig {
    /// Broadcast buffer per subscriber before it starts lagging
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SyncConfig {
    /// Bounded ingestion queue size for events emitted outside a request
    #[serde(default)]
    pub ingest_capacity: Option<usize>,
    /// Maximum queued events folded into one sync batch
    #[serde(default)]
    pub batch_max: Option<usize>,
    /// Name of the reactive store holding synced values
    #[serde(default)]
    pub state_store: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StoreConfig {
    /// Mirror reactive stores to the durable cache
    #[serde(default)]
    pub persist: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Effective state directory: `KSYNC_STATE_DIR`, then the config value,
    /// then the platform data dir, then `./state`.
    pub fn state_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("KSYNC_STATE_DIR") {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        if let Some(dir) = self.runtime.state_dir.as_deref() {
            return PathBuf::from(dir);
        }
        directories::ProjectDirs::from("dev", "ksync", "ksync")
            .map(|p| p.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("state"))
    }

    pub fn cache_path(&self) -> PathBuf {
        let file = self
            .runtime
            .cache_file
            .as_deref()
            .unwrap_or(ksync_kernel::DEFAULT_CACHE_FILE);
        self.state_dir().join(file)
    }

    pub fn bus_capacity(&self) -> usize {
        self.bus.capacity.unwrap_or(DEFAULT_BUS_CAPACITY).max(1)
    }

    pub fn ingest_capacity(&self) -> usize {
        self.sync.ingest_capacity.unwrap_or(DEFAULT_INGEST_CAPACITY).max(1)
    }

    pub fn batch_max(&self) -> usize {
        self.sync.batch_max.unwrap_or(DEFAULT_BATCH_MAX).max(1)
    }

    pub fn state_store(&self) -> &str {
        self.sync.state_store.as_deref().unwrap_or(DEFAULT_STATE_STORE)
    }

    /// `KSYNC_STORE_PERSIST` overrides the file setting.
    pub fn persist_stores(&self) -> bool {
        env_flag("KSYNC_STORE_PERSIST")
            .or(self.store.persist)
            .unwrap_or(true)
    }
}

/// Boolean-ish environment flag: 1/0, true/false, yes/no, on/off.
fn env_flag(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: &Path) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content).context("parse config toml")?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn empty_config_uses_defaults() {
        std::env::remove_var("KSYNC_STATE_DIR");
        std::env::remove_var("KSYNC_STORE_PERSIST");
        let cfg = parse_config("").expect("empty config");
        assert_eq!(cfg.bus_capacity(), DEFAULT_BUS_CAPACITY);
        assert_eq!(cfg.ingest_capacity(), DEFAULT_INGEST_CAPACITY);
        assert_eq!(cfg.batch_max(), DEFAULT_BATCH_MAX);
        assert_eq!(cfg.state_store(), DEFAULT_STATE_STORE);
        assert!(cfg.persist_stores());
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let err = parse_config("[bus]\ncapacity = \"lots\"\n").unwrap_err();
        assert!(err.to_string().contains("lots"), "{err}");
    }

    #[test]
    #[serial]
    fn env_overrides_state_dir_and_persist() {
        let cfg = parse_config(
            "[runtime]\nstate_dir = \"/tmp/from-file\"\ncache_file = \"c.db\"\n[store]\npersist = true\n",
        )
        .unwrap();
        std::env::remove_var("KSYNC_STATE_DIR");
        assert_eq!(cfg.cache_path(), PathBuf::from("/tmp/from-file/c.db"));
        std::env::set_var("KSYNC_STATE_DIR", "/tmp/from-env");
        std::env::set_var("KSYNC_STORE_PERSIST", "off");
        let dir = cfg.state_dir();
        let persist = cfg.persist_stores();
        std::env::remove_var("KSYNC_STATE_DIR");
        std::env::remove_var("KSYNC_STORE_PERSIST");
        assert_eq!(dir, PathBuf::from("/tmp/from-env"));
        assert!(!persist);
    }

    #[test]
    fn load_config_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ksync.toml");
        std::fs::write(&path, "[sync]\nbatch_max = 8\n").unwrap();
        assert_eq!(load_config(&path).unwrap().batch_max(), 8);
        let missing = dir.path().join("missing.toml");
        let err = load_config(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("missing.toml"));
    }
}
