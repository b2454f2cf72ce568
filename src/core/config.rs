//! `appdeck.toml` loading.
//!
//! The file is optional; every field has a default so an empty root works out of the box.

use crate::core::error::DeckError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "appdeck.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeckConfig {
    pub engine: EngineConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Container runtime binary; invoked as `<binary> compose ...`.
    pub binary: String,
    pub timeout_secs: u64,
    /// Extra attempts for idempotent `up -d` dispatches that exit nonzero.
    pub up_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            timeout_secs: 300,
            up_retries: 0,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub catalog_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            catalog_dir: PathBuf::from("catalog"),
        }
    }
}

/// Load `<root>/appdeck.toml`. A missing file yields the defaults.
pub fn load_config(root: &Path) -> Result<DeckConfig, DeckError> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Ok(DeckConfig::default());
    }

    let content = fs::read_to_string(&config_path).map_err(DeckError::IoError)?;
    let config: DeckConfig = toml::from_str(&content)
        .map_err(|e| DeckError::ConfigError(format!("{}: {}", config_path.display(), e)))?;
    if config.engine.timeout_secs == 0 {
        return Err(DeckError::ConfigError(
            "engine.timeout_secs must be greater than zero".to_string(),
        ));
    }
    Ok(config)
}
