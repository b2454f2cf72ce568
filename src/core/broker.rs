use crate::core::db;
use crate::core::error;
use crate::core::schemas;
use crate::core::time;
use rusqlite::Connection;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// The DB Broker is the single path for state access.
/// Writers to the same database file are serialized in-process; every operation is audited.
#[derive(Debug, Clone)]
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

fn db_lock(db_path: &Path) -> Result<Arc<Mutex<()>>, error::DeckError> {
    static LOCKS: OnceLock<Mutex<FxHashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(|| Mutex::new(FxHashMap::default()))
        .lock()
        .map_err(|_| error::DeckError::ValidationError("broker lock table poisoned".to_string()))?;
    Ok(locks
        .entry(db_path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(schemas::BROKER_EVENTS_NAME),
        }
    }

    /// Execute a closure with a serialized connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, error::DeckError>
    where
        F: FnOnce(&Connection) -> Result<R, error::DeckError>,
    {
        let lock = db_lock(db_path)?;
        let _guard = lock
            .lock()
            .map_err(|_| error::DeckError::ValidationError("broker write lock poisoned".to_string()))?;

        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let conn = db::db_connect(&db_path.to_string_lossy())?;

        let result = f(&conn);

        // The closure's writes are already committed; an audit failure must not turn them into
        // an error.
        let status = if result.is_ok() { "success" } else { "error" };
        if let Err(e) = self.log_event(actor, op_name, &db_id, status) {
            tracing::warn!(actor, op = op_name, db = %db_id, error = %e, "failed to append broker audit event");
        }

        result
    }

    fn log_event(
        &self,
        actor: &str,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), error::DeckError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };
        append_jsonl(&self.audit_log_path, &ev)
    }
}

/// Append one serialized event as a line to a JSONL audit file.
pub fn append_jsonl<T: Serialize>(path: &Path, event: &T) -> Result<(), error::DeckError> {
    let line = serde_json::to_string(event)?;
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(error::DeckError::IoError)?;
    writeln!(f, "{}", line).map_err(error::DeckError::IoError)?;
    Ok(())
}
