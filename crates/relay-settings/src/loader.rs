//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides
//!
//! Loading usually happens before logging is configured, so unusable
//! overrides are returned to the caller rather than logged here.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::cell::RefCell;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{RelaySettings, StoreBackend};

/// An environment variable that was set but could not be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedOverride {
    pub key: &'static str,
    pub value: String,
    pub expected: &'static str,
}

#[derive(Debug)]
pub struct LoadedSettings {
    pub settings: RelaySettings,
    pub rejected: Vec<RejectedOverride>,
}

/// Load settings from `path` (if present) with env var overrides.
pub fn load_settings_from_path(path: &Path) -> Result<LoadedSettings> {
    let mut settings = load_settings_file(path)?;
    let rejected = apply_env_overrides(&mut settings);
    Ok(LoadedSettings { settings, rejected })
}

/// Load defaults merged with `path`, without consulting the environment.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_file(path: &Path) -> Result<RelaySettings> {
    let parse_err = |source| SettingsError::Parse {
        path: path.to_owned(),
        source,
    };
    let defaults = serde_json::to_value(RelaySettings::default()).map_err(parse_err)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(parse_err)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    serde_json::from_value(merged).map_err(parse_err)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides.
pub fn apply_env_overrides(settings: &mut RelaySettings) -> Vec<RejectedOverride> {
    apply_overrides_from(settings, |name| std::env::var(name).ok())
}

/// Apply overrides read through `lookup`. Empty values are ignored;
/// unparsable ones are skipped and returned.
pub fn apply_overrides_from<F>(settings: &mut RelaySettings, lookup: F) -> Vec<RejectedOverride>
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader {
        lookup,
        rejected: RefCell::new(Vec::new()),
    };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.u16("PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("RELAY_REQUEST_TIMEOUT_SECS", 1, 3600) {
        settings.server.request_timeout_secs = v;
    }
    if let Some(v) = env.bool("RELAY_CANCEL_ON_DISCONNECT") {
        settings.server.cancel_on_disconnect = v;
    }

    // ── Upstream AI ─────────────────────────────────────────────────
    if let Some(v) = env.string("AI_API_KEY") {
        settings.ai.api_key = v;
    }
    if let Some(v) = env.string("AI_BASE_URL") {
        settings.ai.base_url = v;
    }
    if let Some(v) = env.string("AI_MODEL") {
        settings.ai.model = v;
    }
    if let Some(v) = env.string("AI_THINKING") {
        settings.ai.thinking = Some(v);
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.string("JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }
    if let Some(v) = env.u64("JWT_EXPIRE_HOURS", 1, 24 * 365) {
        settings.auth.token_ttl_hours = u32::try_from(v).unwrap_or(u32::MAX);
    }

    // ── Logging & store ─────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("RELAY_LOG_FORMAT") {
        settings.logging.format = v;
    }
    if let Some(v) = env.string("RELAY_STORE_BACKEND") {
        match parse_backend(&v) {
            Some(backend) => settings.store.backend = backend,
            None => env.reject("RELAY_STORE_BACKEND", v, "memory or sqlite"),
        }
    }
    if let Some(v) = env.string("RELAY_STORE_PATH") {
        settings.store.path = v;
    }

    env.rejected.into_inner()
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn parse_backend(val: &str) -> Option<StoreBackend> {
    match val.to_lowercase().as_str() {
        "memory" => Some(StoreBackend::Memory),
        "sqlite" => Some(StoreBackend::Sqlite),
        _ => None,
    }
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
    rejected: RefCell<Vec<RejectedOverride>>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn reject(&self, key: &'static str, value: String, expected: &'static str) {
        self.rejected.borrow_mut().push(RejectedOverride { key, value, expected });
    }

    fn parsed<T>(
        &self,
        name: &'static str,
        expected: &'static str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            self.reject(name, val, expected);
        }
        result
    }

    fn bool(&self, name: &'static str) -> Option<bool> {
        self.parsed(name, "a boolean", parse_bool)
    }

    fn u16(&self, name: &'static str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "an integer in range", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &'static str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "an integer in range", |v| parse_u64_range(v, min, max))
    }
}
