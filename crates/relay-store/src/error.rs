#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// A unique field (`username` or `email`) is already in use.
    #[error("{0} already exists")]
    Conflict(&'static str),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
