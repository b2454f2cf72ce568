//! On-disk app bundles.
//!
//! The core never touches paths directly: it names an app id and the filesystem resolves where
//! that app's compose file, env file and data directory live. App ids are validated before any
//! path is built from them.

use crate::core::error::DeckError;
use crate::core::store::Store;
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const COMPOSE_FILE_NAME: &str = "docker-compose.yml";
pub const ENV_FILE_NAME: &str = "app.env";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

static APP_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").unwrap());

/// Reject anything that could escape the data root or collide with compose project naming.
pub fn validate_app_id(app_id: &str) -> Result<(), DeckError> {
    if APP_ID_PATTERN.is_match(app_id) {
        Ok(())
    } else {
        Err(DeckError::ValidationError(format!(
            "invalid app id '{}': expected [a-z0-9][a-z0-9_-]*",
            app_id
        )))
    }
}

static ENV_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// One env file entry must stay one `KEY=value` line.
pub fn validate_env_entry(key: &str, value: &str) -> Result<(), DeckError> {
    if !ENV_KEY_PATTERN.is_match(key) {
        return Err(DeckError::ValidationError(format!(
            "invalid env variable name '{}': expected [A-Za-z_][A-Za-z0-9_]*",
            key
        )));
    }
    if value.contains(['\n', '\r', '\0']) {
        return Err(DeckError::ValidationError(format!(
            "value for env variable '{}' contains a line break or NUL",
            key
        )));
    }
    Ok(())
}

/// A catalog entry describing an installable app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppManifest {
    pub id: String,
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub form_fields: Vec<FormField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub env_variable: String,
    #[serde(default)]
    pub default: Option<String>,
}

/// Parts of a bundle whose existence can be checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlePath {
    Bundle,
    Compose,
    Env,
    Data,
}

/// Filesystem boundary used by lifecycle commands. Every method is fallible I/O.
pub trait AppFilesystem: Send + Sync {
    fn compose_path(&self, app_id: &str) -> PathBuf;
    fn env_path(&self, app_id: &str) -> PathBuf;
    fn data_dir(&self, app_id: &str) -> PathBuf;
    fn exists(&self, app_id: &str, what: BundlePath) -> bool;

    /// Catalog manifest for `app_id`, `None` when the catalog has no such app.
    fn read_manifest(&self, app_id: &str) -> Result<Option<AppManifest>, DeckError>;
    /// Copy the catalog's compose definition into the app's bundle, creating the bundle.
    fn install_compose(&self, app_id: &str) -> Result<PathBuf, DeckError>;
    fn read_compose(&self, app_id: &str) -> Result<String, DeckError>;
    fn write_compose(&self, app_id: &str, contents: &str) -> Result<(), DeckError>;
    fn read_env(&self, app_id: &str) -> Result<BTreeMap<String, String>, DeckError>;
    fn write_env(&self, app_id: &str, env: &BTreeMap<String, String>) -> Result<(), DeckError>;

    fn create_data_dir(&self, app_id: &str) -> Result<(), DeckError>;
    fn remove_data_dir(&self, app_id: &str) -> Result<(), DeckError>;
    fn normalize_permissions(&self, app_id: &str) -> Result<(), DeckError>;
    /// Snapshot the data directory and bundle; returns the snapshot directory.
    fn backup(&self, app_id: &str) -> Result<PathBuf, DeckError>;
    /// Remove the bundle directory (compose + env). Missing is not an error.
    fn remove_bundle(&self, app_id: &str) -> Result<(), DeckError>;
}

/// Bundles under a local data root, laid out by [`Store`].
#[derive(Debug, Clone)]
pub struct LocalAppFilesystem {
    store: Store,
}

impl LocalAppFilesystem {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn bundle_dir(&self, app_id: &str) -> PathBuf {
        self.store.apps_dir().join(app_id)
    }

    fn catalog_entry(&self, app_id: &str) -> PathBuf {
        self.store.catalog_dir.join(app_id)
    }
}

impl AppFilesystem for LocalAppFilesystem {
    fn compose_path(&self, app_id: &str) -> PathBuf {
        self.bundle_dir(app_id).join(COMPOSE_FILE_NAME)
    }

    fn env_path(&self, app_id: &str) -> PathBuf {
        self.bundle_dir(app_id).join(ENV_FILE_NAME)
    }

    fn data_dir(&self, app_id: &str) -> PathBuf {
        self.store.app_data_root().join(app_id)
    }

    fn exists(&self, app_id: &str, what: BundlePath) -> bool {
        let path = match what {
            BundlePath::Bundle => self.bundle_dir(app_id),
            BundlePath::Compose => self.compose_path(app_id),
            BundlePath::Env => self.env_path(app_id),
            BundlePath::Data => self.data_dir(app_id),
        };
        path.exists()
    }

    fn read_manifest(&self, app_id: &str) -> Result<Option<AppManifest>, DeckError> {
        validate_app_id(app_id)?;
        let path = self.catalog_entry(app_id).join(MANIFEST_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(DeckError::IoError)?;
        let manifest: AppManifest = serde_json::from_str(&raw)?;
        if manifest.id != app_id {
            return Err(DeckError::ValidationError(format!(
                "catalog manifest {} declares id '{}'",
                path.display(),
                manifest.id
            )));
        }
        Ok(Some(manifest))
    }

    fn install_compose(&self, app_id: &str) -> Result<PathBuf, DeckError> {
        validate_app_id(app_id)?;
        let source = self.catalog_entry(app_id).join(COMPOSE_FILE_NAME);
        if !source.exists() {
            return Err(DeckError::NotFound(format!(
                "catalog compose definition {}",
                source.display()
            )));
        }
        let target = self.compose_path(app_id);
        fs::create_dir_all(self.bundle_dir(app_id)).map_err(DeckError::IoError)?;
        fs::copy(&source, &target).map_err(DeckError::IoError)?;
        Ok(target)
    }

    fn read_compose(&self, app_id: &str) -> Result<String, DeckError> {
        validate_app_id(app_id)?;
        fs::read_to_string(self.compose_path(app_id)).map_err(DeckError::IoError)
    }

    fn write_compose(&self, app_id: &str, contents: &str) -> Result<(), DeckError> {
        validate_app_id(app_id)?;
        fs::create_dir_all(self.bundle_dir(app_id)).map_err(DeckError::IoError)?;
        fs::write(self.compose_path(app_id), contents).map_err(DeckError::IoError)
    }

    fn read_env(&self, app_id: &str) -> Result<BTreeMap<String, String>, DeckError> {
        validate_app_id(app_id)?;
        let raw = fs::read_to_string(self.env_path(app_id)).map_err(DeckError::IoError)?;
        Ok(parse_env(&raw))
    }

    fn write_env(&self, app_id: &str, env: &BTreeMap<String, String>) -> Result<(), DeckError> {
        validate_app_id(app_id)?;
        fs::create_dir_all(self.bundle_dir(app_id)).map_err(DeckError::IoError)?;
        let path = self.env_path(app_id);
        let contents = render_env_file(env)?;
        fs::write(&path, contents).map_err(DeckError::IoError)?;
        set_mode(&path, 0o600)
    }

    fn create_data_dir(&self, app_id: &str) -> Result<(), DeckError> {
        validate_app_id(app_id)?;
        fs::create_dir_all(self.data_dir(app_id)).map_err(DeckError::IoError)
    }

    fn remove_data_dir(&self, app_id: &str) -> Result<(), DeckError> {
        validate_app_id(app_id)?;
        remove_dir_if_exists(&self.data_dir(app_id))
    }

    fn normalize_permissions(&self, app_id: &str) -> Result<(), DeckError> {
        validate_app_id(app_id)?;
        let data = self.data_dir(app_id);
        if !data.exists() {
            return Err(DeckError::NotFound(format!("data directory {}", data.display())));
        }
        // Containers run as arbitrary uids; the data tree must be group-writable.
        walk_dirs(&data, &mut |dir| set_mode(dir, 0o775))
    }

    fn backup(&self, app_id: &str) -> Result<PathBuf, DeckError> {
        validate_app_id(app_id)?;
        let target = self
            .store
            .backups_dir()
            .join(app_id)
            .join(format!("{}-{}", time::epoch_secs(), time::new_event_id().to_lowercase()));
        fs::create_dir_all(&target).map_err(DeckError::IoError)?;
        let data = self.data_dir(app_id);
        if data.exists() {
            copy_tree(&data, &target.join("data"))?;
        }
        let bundle = self.bundle_dir(app_id);
        if bundle.exists() {
            copy_tree(&bundle, &target.join("bundle"))?;
        }
        Ok(target)
    }

    fn remove_bundle(&self, app_id: &str) -> Result<(), DeckError> {
        validate_app_id(app_id)?;
        remove_dir_if_exists(&self.bundle_dir(app_id))
    }
}

/// Parse `KEY=value` lines; blank lines and `#` comments are skipped.
pub fn parse_env(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let (k, v) = l.split_once('=')?;
            Some((k.trim().to_string(), v.to_string()))
        })
        .collect()
}

/// Fails without output on the first entry that would not fit on one line.
pub fn render_env_file(env: &BTreeMap<String, String>) -> Result<String, DeckError> {
    let mut out = String::new();
    for (k, v) in env {
        validate_env_entry(k, v)?;
        out.push_str(k);
        out.push('=');
        out.push_str(v);
        out.push('\n');
    }
    Ok(out)
}

fn remove_dir_if_exists(path: &Path) -> Result<(), DeckError> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(DeckError::IoError)?;
    }
    Ok(())
}

fn walk_dirs(
    dir: &Path,
    f: &mut dyn FnMut(&Path) -> Result<(), DeckError>,
) -> Result<(), DeckError> {
    f(dir)?;
    for entry in fs::read_dir(dir).map_err(DeckError::IoError)? {
        let entry = entry.map_err(DeckError::IoError)?;
        let file_type = entry.file_type().map_err(DeckError::IoError)?;
        if file_type.is_dir() {
            walk_dirs(&entry.path(), f)?;
        }
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), DeckError> {
    fs::create_dir_all(to).map_err(DeckError::IoError)?;
    for entry in fs::read_dir(from).map_err(DeckError::IoError)? {
        let entry = entry.map_err(DeckError::IoError)?;
        let file_type = entry.file_type().map_err(DeckError::IoError)?;
        let dest = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest).map_err(DeckError::IoError)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), DeckError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(DeckError::IoError)
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), DeckError> {
    Ok(())
}
