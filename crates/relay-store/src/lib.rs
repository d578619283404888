pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use relay_core::{Message, UserId};
use serde::Serialize;

/// A message as persisted, with its store-assigned id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    #[serde(flatten)]
    pub message: Message,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// A registered account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: String,
}

/// Fields for a new account; the password is already hashed.
#[derive(Clone, Copy, Debug)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
}

/// Account lookup for register and login.
pub trait UserStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the username or email is taken.
    fn create_user(&self, user: &NewUser<'_>) -> Result<UserRecord, StoreError>;

    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
}

/// Create/query access to persisted messages.
pub trait MessageStore: Send + Sync {
    fn create(&self, message: &Message) -> Result<StoredMessage, StoreError>;

    /// Most recent messages owned by `owner`, newest first.
    fn list_for_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;
}
