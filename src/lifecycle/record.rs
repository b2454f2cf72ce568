//! App records and the store that owns them.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::DeckError;
use crate::core::time;
use crate::lifecycle::status::AppStatus;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

/// One installed application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: String,
    pub status: AppStatus,
    /// Catalog version of the installed bundle.
    pub version: u32,
    /// Opaque form data; replaced wholesale on install and update-config.
    pub config: JsonValue,
    /// Path of the compose file inside the app's bundle.
    pub compose_path: PathBuf,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AppRecord {
    pub fn new(
        id: &str,
        status: AppStatus,
        version: u32,
        config: JsonValue,
        compose_path: PathBuf,
    ) -> Self {
        let now = time::now_epoch_z();
        Self {
            id: id.to_string(),
            status,
            version,
            config,
            compose_path,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppRecordPatch {
    pub status: Option<AppStatus>,
    pub version: Option<u32>,
    pub config: Option<JsonValue>,
    /// `Some(None)` clears the stored error.
    pub last_error: Option<Option<String>>,
}

impl AppRecordPatch {
    pub fn status(status: AppStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Terminal write after a successful engine call.
    pub fn settled(status: AppStatus) -> Self {
        Self {
            status: Some(status),
            last_error: Some(None),
            ..Self::default()
        }
    }

    /// Terminal write after a failure, keeping the reason.
    pub fn failed(status: AppStatus, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            last_error: Some(Some(reason.into())),
            ..Self::default()
        }
    }

    /// Record a reason without touching the status.
    pub fn noted(reason: impl Into<String>) -> Self {
        Self {
            last_error: Some(Some(reason.into())),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = Some(config);
        self
    }
}

/// Result of an atomic check-and-set on an app's status.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The status was in the allowed set and has been replaced; carries the updated record.
    Applied(AppRecord),
    /// The status was not in the allowed set; nothing was written.
    Rejected(AppStatus),
    Missing,
}

/// Persistence boundary for app records. All status writes go through here.
pub trait AppRecordStore: Send + Sync {
    fn get(&self, app_id: &str) -> Result<Option<AppRecord>, DeckError>;
    /// Insert a new record. Fails with `ValidationError` if the id already exists.
    fn create(&self, record: AppRecord) -> Result<AppRecord, DeckError>;
    fn update(&self, app_id: &str, patch: AppRecordPatch) -> Result<Option<AppRecord>, DeckError>;
    fn delete(&self, app_id: &str) -> Result<(), DeckError>;
    fn list(&self) -> Result<Vec<AppRecord>, DeckError>;
    fn list_by_status(&self, status: AppStatus) -> Result<Vec<AppRecord>, DeckError>;
    fn list_by_status_not_in(&self, statuses: &[AppStatus]) -> Result<Vec<AppRecord>, DeckError>;
    /// Read-check-write as one atomic unit: move `app_id` to `to` only if its current status
    /// is one of `allowed_from`.
    fn transition(
        &self,
        app_id: &str,
        allowed_from: &[AppStatus],
        to: AppStatus,
    ) -> Result<Transition, DeckError>;
}

/// SQLite-backed record store (`apps.db` under the data root).
pub struct SqliteAppStore {
    root: PathBuf,
    db_path: PathBuf,
    broker: DbBroker,
}

const SELECT_COLUMNS: &str =
    "SELECT id, status, version, config, compose_path, last_error, created_at, updated_at FROM apps";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AppRecord> {
    let status_raw: String = row.get(1)?;
    let status = status_raw.parse::<AppStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    let config_raw: String = row.get(3)?;
    let config = serde_json::from_str(&config_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let compose_path: String = row.get(4)?;
    Ok(AppRecord {
        id: row.get(0)?,
        status,
        version: row.get(2)?,
        config,
        compose_path: PathBuf::from(compose_path),
        last_error: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<AppRecord>, DeckError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_record)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn get_record(conn: &Connection, app_id: &str) -> Result<Option<AppRecord>, DeckError> {
    let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![app_id], row_to_record)
        .optional()?)
}

impl SqliteAppStore {
    /// Open (and create if needed) the store under `root`.
    pub fn open(root: &Path) -> Result<Self, DeckError> {
        db::initialize_apps_db(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            db_path: db::apps_db_path(root),
            broker: DbBroker::new(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn with_conn<F, R>(&self, op: &str, f: F) -> Result<R, DeckError>
    where
        F: FnOnce(&Connection) -> Result<R, DeckError>,
    {
        self.broker.with_conn(&self.db_path, "appdeck", op, f)
    }
}

impl AppRecordStore for SqliteAppStore {
    fn get(&self, app_id: &str) -> Result<Option<AppRecord>, DeckError> {
        self.with_conn("apps.get", |conn| get_record(conn, app_id))
    }

    fn create(&self, record: AppRecord) -> Result<AppRecord, DeckError> {
        self.with_conn("apps.create", |conn| {
            if get_record(conn, &record.id)?.is_some() {
                return Err(DeckError::ValidationError(format!(
                    "app '{}' already exists",
                    record.id
                )));
            }
            conn.execute(
                "INSERT INTO apps (id, status, version, config, compose_path, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.status.as_str(),
                    record.version,
                    serde_json::to_string(&record.config)?,
                    record.compose_path.to_string_lossy().to_string(),
                    record.last_error,
                    record.created_at,
                    record.updated_at,
                ],
            )?;
            Ok(record)
        })
    }

    fn update(&self, app_id: &str, patch: AppRecordPatch) -> Result<Option<AppRecord>, DeckError> {
        self.with_conn("apps.update", |conn| {
            let Some(mut record) = get_record(conn, app_id)? else {
                return Ok(None);
            };
            if let Some(status) = patch.status {
                record.status = status;
            }
            if let Some(version) = patch.version {
                record.version = version;
            }
            if let Some(config) = patch.config {
                record.config = config;
            }
            if let Some(last_error) = patch.last_error {
                record.last_error = last_error;
            }
            record.updated_at = time::now_epoch_z();
            conn.execute(
                "UPDATE apps SET status = ?2, version = ?3, config = ?4, last_error = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    app_id,
                    record.status.as_str(),
                    record.version,
                    serde_json::to_string(&record.config)?,
                    record.last_error,
                    record.updated_at,
                ],
            )?;
            Ok(Some(record))
        })
    }

    fn delete(&self, app_id: &str) -> Result<(), DeckError> {
        self.with_conn("apps.delete", |conn| {
            conn.execute("DELETE FROM apps WHERE id = ?1", params![app_id])?;
            Ok(())
        })
    }

    fn list(&self) -> Result<Vec<AppRecord>, DeckError> {
        self.with_conn("apps.list", |conn| {
            let sql = format!("{} ORDER BY id", SELECT_COLUMNS);
            query_records(conn, &sql, &[])
        })
    }

    fn list_by_status(&self, status: AppStatus) -> Result<Vec<AppRecord>, DeckError> {
        self.with_conn("apps.list_by_status", |conn| {
            let sql = format!("{} WHERE status = ?1 ORDER BY id", SELECT_COLUMNS);
            let name = status.as_str();
            query_records(conn, &sql, &[&name as &dyn rusqlite::ToSql])
        })
    }

    fn list_by_status_not_in(&self, statuses: &[AppStatus]) -> Result<Vec<AppRecord>, DeckError> {
        self.with_conn("apps.list_by_status_not_in", |conn| {
            if statuses.is_empty() {
                let sql = format!("{} ORDER BY id", SELECT_COLUMNS);
                return query_records(conn, &sql, &[]);
            }
            let placeholders = (1..=statuses.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "{} WHERE status NOT IN ({}) ORDER BY id",
                SELECT_COLUMNS, placeholders
            );
            let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
            let args: Vec<&dyn rusqlite::ToSql> =
                names.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
            query_records(conn, &sql, &args)
        })
    }

    fn transition(
        &self,
        app_id: &str,
        allowed_from: &[AppStatus],
        to: AppStatus,
    ) -> Result<Transition, DeckError> {
        self.with_conn("apps.transition", |conn| {
            let tx = conn.unchecked_transaction()?;
            let Some(mut record) = get_record(&tx, app_id)? else {
                return Ok(Transition::Missing);
            };
            if !allowed_from.contains(&record.status) {
                return Ok(Transition::Rejected(record.status));
            }
            record.updated_at = time::now_epoch_z();
            // Conditional on the status we checked, so a writer in another process that got
            // in between is detected instead of overwritten.
            let changed = tx.execute(
                "UPDATE apps SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
                params![app_id, to.as_str(), record.updated_at, record.status.as_str()],
            )?;
            if changed == 0 {
                let current = get_record(&tx, app_id)?
                    .map(|r| r.status)
                    .unwrap_or(AppStatus::Missing);
                return Ok(Transition::Rejected(current));
            }
            tx.commit()?;
            record.status = to;
            Ok(Transition::Applied(record))
        })
    }
}
