use chrono::Utc;
use parking_lot::Mutex;
use relay_core::{Message, UserId};

use crate::error::StoreError;
use crate::{MessageStore, NewUser, StoredMessage, UserRecord, UserStore};

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<StoredMessage>>,
    users: Mutex<Vec<UserRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl MessageStore for MemoryStore {
    fn create(&self, message: &Message) -> Result<StoredMessage, StoreError> {
        let mut rows = self.rows.lock();
        let id = i64::try_from(rows.len()).map_err(|e| StoreError::Io(e.to_string()))? + 1;
        let stored = StoredMessage {
            id,
            message: message.clone(),
            created_at: Utc::now().to_rfc3339(),
        };
        rows.push(stored.clone());
        Ok(stored)
    }

    fn list_for_owner(&self, owner: &UserId, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .rev()
            .filter(|r| r.message.owner() == owner)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl UserStore for MemoryStore {
    fn create_user(&self, user: &NewUser<'_>) -> Result<UserRecord, StoreError> {
        let mut users = self.users.lock();
        if users.iter().any(|u| u.username == user.username) {
            return Err(StoreError::Conflict("username"));
        }
        if users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("email"));
        }
        let id = i64::try_from(users.len()).map_err(|e| StoreError::Io(e.to_string()))? + 1;
        let record = UserRecord {
            id,
            username: user.username.to_owned(),
            email: user.email.to_owned(),
            password_hash: user.password_hash.to_owned(),
            created_at: Utc::now().to_rfc3339(),
        };
        users.push(record.clone());
        Ok(record)
    }

    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.lock().iter().find(|u| u.username == username).cloned())
    }
}
