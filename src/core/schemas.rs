//! Database schema definitions for the app record store.
//!
//! Appdeck keeps a single SQLite database (`apps.db`) under the data root. One row per
//! installed application; the compose bundle itself lives on disk and is only referenced.

pub const APPS_DB_NAME: &str = "apps.db";

pub const APPS_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS apps (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        config TEXT NOT NULL DEFAULT '{}', -- JSON object, replaced wholesale
        compose_path TEXT NOT NULL,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";
pub const APPS_DB_SCHEMA_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_apps_status ON apps(status)";

pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";
pub const DISPATCH_EVENTS_NAME: &str = "dispatch.events.jsonl";
