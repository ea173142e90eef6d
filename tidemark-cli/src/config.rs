use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tidemark_sync::EngineConfig;

fn default_status_poll_secs() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the local cache and the remote database
    pub storage_path: PathBuf,
    /// Byte quota of the local cache; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_quota_bytes: Option<usize>,
    /// Status refresh interval while `run` is active
    #[serde(default = "default_status_poll_secs")]
    pub status_poll_secs: u64,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Default configuration rooted at `storage_path`
    pub fn with_storage(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            local_quota_bytes: None,
            status_poll_secs: default_status_poll_secs(),
            engine: EngineConfig::default(),
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Config> {
        Self::load_from(&get_config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config
            .engine
            .validate()
            .with_context(|| format!("Invalid engine settings in {}", config_path.display()))?;

        Ok(config)
    }

    /// Check if configuration file exists
    pub fn exists() -> Result<bool> {
        let config_path = get_config_path()?;
        Ok(config_path.exists())
    }

    /// JSON document backing the local cache
    pub fn local_cache_path(&self) -> PathBuf {
        self.storage_path.join("local.json")
    }

    /// SQLite database standing in for the remote store
    pub fn remote_db_path(&self) -> PathBuf {
        self.storage_path.join("remote.db")
    }
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".tidemark").join("config.toml"))
}

/// Get the default storage path
pub fn default_storage_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".tidemark").join("storage"))
}
