//! SQLite schema, versioned through `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

pub const PRAGMAS: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
";

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "messages",
        sql: r"
CREATE TABLE messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    type TEXT NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_messages_owner ON messages(owner, id);
",
    },
    Migration {
        version: 2,
        description: "users",
        sql: r"
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);
",
    },
];

/// Newest schema version this build knows.
pub const SCHEMA_VERSION: u32 = 2;

pub fn current_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Apply every migration newer than the database's `user_version`, each in
/// its own transaction. Returns how many ran.
pub fn migrate(conn: &Connection) -> Result<u32, StoreError> {
    let current = current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Database(format!(
            "database schema v{current} is newer than this build (v{SCHEMA_VERSION})"
        )));
    }

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql).map_err(|e| {
            StoreError::Database(format!("migration v{} ({}): {e}", migration.version, migration.description))
        })?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
        info!(version = migration.version, description = migration.description, "applied migration");
        applied += 1;
    }
    Ok(applied)
}
