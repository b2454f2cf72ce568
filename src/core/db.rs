use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::DeckError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::DeckError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::DeckError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::DeckError::RusqliteError)?;
    Ok(conn)
}

pub fn apps_db_path(root: &Path) -> PathBuf {
    root.join(schemas::APPS_DB_NAME)
}

pub fn initialize_apps_db(root: &Path) -> Result<(), error::DeckError> {
    fs::create_dir_all(root).map_err(error::DeckError::IoError)?;

    let db_path = apps_db_path(root);
    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "appdeck", "apps.init", |conn| {
        conn.execute(schemas::APPS_DB_SCHEMA, [])?;
        conn.execute(schemas::APPS_DB_SCHEMA_STATUS_INDEX, [])?;
        Ok(())
    })?;

    tracing::debug!(path = %db_path.display(), "apps database initialized");
    Ok(())
}
