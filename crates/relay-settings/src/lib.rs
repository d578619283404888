//! # relay-settings
//!
//! Settings for the relay server: compiled defaults, optionally deep-merged
//! with a JSON file, then overridden by environment variables. The binary
//! applies CLI flags last.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings_file,
    load_settings_from_path, LoadedSettings, RejectedOverride,
};
pub use types::*;
