use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Not JSON, or JSON that does not fit the settings types.
    #[error("bad settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{key}: {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, SettingsError>;
