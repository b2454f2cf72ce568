//! Data-root layout for appdeck's on-disk state.
//!
//! Everything appdeck owns lives under one root directory:
//! - `apps.db`: the app record store
//! - `apps/<id>/`: the bundle (compose definition + env file)
//! - `app-data/<id>/`: the app's persistent data directory
//! - `backups/<id>/<ts>/`: data snapshots taken before updates
//! - `catalog/<id>/`: available app definitions (manifest + compose template)
//! - `run/<id>.lock`: advisory claim held while an operation on the app is in flight

use crate::core::config::DeckConfig;
use crate::core::db;
use crate::core::schemas;
use std::path::{Path, PathBuf};

pub const ROOT_ENV: &str = "APPDECK_ROOT";
pub const DEFAULT_ROOT: &str = ".appdeck";

/// Store handle representing an appdeck data root.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute or caller-relative path to the data root
    pub root: PathBuf,
    /// Catalog location, resolved against the root when relative
    pub catalog_dir: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, config: &DeckConfig) -> Self {
        let root = root.into();
        let catalog_dir = if config.paths.catalog_dir.is_absolute() {
            config.paths.catalog_dir.clone()
        } else {
            root.join(&config.paths.catalog_dir)
        };
        Self { root, catalog_dir }
    }

    pub fn db_path(&self) -> PathBuf {
        db::apps_db_path(&self.root)
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    pub fn app_data_root(&self) -> PathBuf {
        self.root.join("app-data")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn claims_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn dispatch_log_path(&self) -> PathBuf {
        self.root.join(schemas::DISPATCH_EVENTS_NAME)
    }
}

/// Resolve the data root: explicit flag, then `APPDECK_ROOT`, then `./.appdeck`.
pub fn resolve_root(flag: Option<&Path>) -> PathBuf {
    if let Some(p) = flag {
        return p.to_path_buf();
    }
    match std::env::var(ROOT_ENV) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => PathBuf::from(DEFAULT_ROOT),
    }
}
