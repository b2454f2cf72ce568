//! Per-app locks.
//!
//! Two layers, both keyed by app id:
//! - [`AppLocks`]: in-process mutexes around every read-check-write against an app record, so
//!   two requests for the same id can never both pass a precheck.
//! - [`AppClaims`]: advisory file locks marking an operation as in flight for as long as its
//!   engine work runs. Other processes see them, and the OS releases them when the owner dies.
//!
//! Distinct ids get distinct locks; nothing here serializes unrelated apps.

use crate::core::error::DeckError;
use fs2::FileExt;
use rustc_hash::FxHashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Per-app entry. Entries are leaked: one small allocation per app id for the process lifetime.
struct LockEntry {
    lock: Mutex<()>,
}

#[derive(Default)]
pub struct AppLocks {
    entries: Mutex<FxHashMap<String, &'static LockEntry>>,
}

/// Held for the duration of one app's critical section.
pub struct AppLease {
    _guard: MutexGuard<'static, ()>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_entry(&self, app_id: &str) -> Result<&'static LockEntry, DeckError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| DeckError::ValidationError("app lock table poisoned".to_string()))?;
        if let Some(entry) = entries.get(app_id) {
            return Ok(*entry);
        }
        let entry: &'static LockEntry = Box::leak(Box::new(LockEntry {
            lock: Mutex::new(()),
        }));
        entries.insert(app_id.to_string(), entry);
        Ok(entry)
    }

    /// Block until the app's lock is free and return the lease.
    pub fn acquire(&self, app_id: &str) -> Result<AppLease, DeckError> {
        let entry = self.get_entry(app_id)?;
        // The unit mutex guards no data, so a poisoned lock is still usable.
        let guard = entry
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(AppLease { _guard: guard })
    }
}

/// Advisory claim files under one directory, one per app id.
#[derive(Debug, Clone)]
pub struct AppClaims {
    dir: PathBuf,
}

/// Ownership of one app's in-flight operation. Dropping it releases the claim.
#[derive(Debug)]
pub struct Claim {
    _file: File,
}

impl AppClaims {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Take the app's claim without blocking. `None` while any other handle holds it, in this
    /// process or another one.
    pub fn try_claim(&self, app_id: &str) -> Result<Option<Claim>, DeckError> {
        fs::create_dir_all(&self.dir).map_err(DeckError::IoError)?;
        let path = self.dir.join(format!("{}.lock", app_id));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(DeckError::IoError)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                // Owner pid, for whoever inspects a stuck app.
                file.set_len(0).map_err(DeckError::IoError)?;
                writeln!(file, "{}", std::process::id()).map_err(DeckError::IoError)?;
                Ok(Some(Claim { _file: file }))
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                tracing::debug!(app_id, path = %path.display(), "app claim held elsewhere");
                Ok(None)
            }
            Err(e) => Err(DeckError::IoError(e)),
        }
    }
}
