use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use relay_core::{Message, MessageType, Sender, UserId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, instrument};

use crate::error::StoreError;
use crate::schema;
use crate::{MessageStore, NewUser, StoredMessage, UserRecord, UserStore};

/// SQLite-backed message store.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path)?;
        let store = Self::init(conn, path.to_owned())?;
        info!(path = %path.display(), "message store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        let _ = schema::migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MessageStore for SqliteStore {
    #[instrument(skip_all, fields(owner = %message.owner(), kind = message.kind().as_str()))]
    fn create(&self, message: &Message) -> Result<StoredMessage, StoreError> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO messages (owner, type, sender, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.owner().as_str(),
                message.kind().as_str(),
                message.sender().as_str(),
                message.content(),
                now
            ],
        )?;
        Ok(StoredMessage {
            id: conn.last_insert_rowid(),
            message: message.clone(),
            created_at: now,
        })
    }

    fn list_for_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, type, sender, content, created_at FROM messages
             WHERE owner = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![owner.as_str(), limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, kind, sender, content, created_at) = row?;
            let message = Message::new(parse_kind(&kind)?, content, parse_sender(&sender)?, owner.clone());
            out.push(StoredMessage {
                id,
                message,
                created_at,
            });
        }
        Ok(out)
    }
}

const USER_COLUMNS: &str = "id, username, email, password_hash, created_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl UserStore for SqliteStore {
    #[instrument(skip_all, fields(username = user.username))]
    fn create_user(&self, user: &NewUser<'_>) -> Result<UserRecord, StoreError> {
        let conn = self.conn.lock();
        for (column, value) in [("username", user.username), ("email", user.email)] {
            let taken = conn
                .query_row(&format!("SELECT 1 FROM users WHERE {column} = ?1"), [value], |_| Ok(()))
                .optional()?;
            if taken.is_some() {
                return Err(StoreError::Conflict(column));
            }
        }

        let now = Utc::now().to_rfc3339();
        let _ = conn.execute(
            "INSERT INTO users (username, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user.username, user.email, user.password_hash, now],
        )?;
        Ok(UserRecord {
            id: conn.last_insert_rowid(),
            username: user.username.to_owned(),
            email: user.email.to_owned(),
            password_hash: user.password_hash.to_owned(),
            created_at: now,
        })
    }

    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                [username],
                user_from_row,
            )
            .optional()?)
    }
}

fn parse_kind(raw: &str) -> Result<MessageType, StoreError> {
    match raw {
        "text" => Ok(MessageType::Text),
        "image" => Ok(MessageType::Image),
        other => Err(StoreError::Corrupt(format!("message type {other}"))),
    }
}

fn parse_sender(raw: &str) -> Result<Sender, StoreError> {
    match raw {
        "client" => Ok(Sender::Client),
        "server" => Ok(Sender::Server),
        other => Err(StoreError::Corrupt(format!("sender {other}"))),
    }
}
