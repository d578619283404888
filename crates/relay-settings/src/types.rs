//! Settings type definitions.
//!
//! All types use camelCase field names and `#[serde(default)]`, so a
//! settings file only needs the keys it changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the relay.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub ai: AiSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
}

impl RelaySettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key, reason| Err(SettingsError::Invalid { key, reason });
        if self.auth.jwt_secret.trim().is_empty() {
            return invalid("auth.jwtSecret", "must be set (JWT_SECRET)");
        }
        if self.auth.bcrypt_cost < 4 || self.auth.bcrypt_cost > 31 {
            return invalid("auth.bcryptCost", "must be between 4 and 31");
        }
        if self.server.request_timeout_secs == 0 {
            return invalid("server.requestTimeoutSecs", "must be positive");
        }
        if self.server.heartbeat_interval_secs == 0 {
            return invalid("server.heartbeatIntervalSecs", "must be positive");
        }
        if self.server.send_queue_capacity == 0 {
            return invalid("server.sendQueueCapacity", "must be positive");
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.trim().is_empty() {
            return invalid("store.path", "required for the sqlite backend");
        }
        Ok(())
    }
}

/// Listener and per-connection behaviour.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound on one upstream chat request, including every chunk.
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Outbound frames buffered per connection before broadcasts count as failed.
    pub send_queue_capacity: usize,
    /// Largest inbound WebSocket message and HTTP body accepted.
    pub max_message_bytes: usize,
    /// Cancel an in-flight chat request when its connection closes.
    pub cancel_on_disconnect: bool,
    /// Grace period for sessions to close on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            request_timeout_secs: 60,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            send_queue_capacity: 256,
            max_message_bytes: 16 * 1024 * 1024,
            cancel_on_disconnect: false,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Upstream chat-completions endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AiSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Forwarded as `{"thinking": {"type": ...}}` when set.
    pub thinking: Option<String>,
    pub image_prompt: String,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            thinking: None,
            image_prompt: "Please describe this image.".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub token_ttl_hours: u32,
    /// bcrypt work factor for stored passwords.
    pub bcrypt_cost: u32,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_hours: 24,
            bcrypt_cost: 12,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            module_levels: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: "data/relay.db".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelaySettings {
        let mut s = RelaySettings::default();
        s.auth.jwt_secret = "secret".into();
        s
    }

    #[test]
    fn defaults() {
        let s = RelaySettings::default();
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.server.request_timeout_secs, 60);
        assert!(!s.server.cancel_on_disconnect);
        assert_eq!(s.auth.token_ttl_hours, 24);
        assert_eq!(s.store.backend, StoreBackend::Memory);
        assert!(s.ai.thinking.is_none());
    }

    #[test]
    fn camel_case_wire_names() {
        let value = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(value["server"]["requestTimeoutSecs"].is_number());
        assert!(value["ai"]["baseUrl"].is_string());
        assert!(value["auth"]["jwtSecret"].is_string());
        assert_eq!(value["store"]["backend"], "memory");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: RelaySettings = serde_json::from_str(r#"{"server":{"port":9000}}"#).unwrap();
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn validate_requires_jwt_secret() {
        assert!(RelaySettings::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut s = valid();
        s.server.request_timeout_secs = 0;
        assert!(matches!(
            s.validate(),
            Err(SettingsError::Invalid { key: "server.requestTimeoutSecs", .. })
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_bcrypt_cost() {
        let mut s = valid();
        s.auth.bcrypt_cost = 2;
        assert!(matches!(
            s.validate(),
            Err(SettingsError::Invalid { key: "auth.bcryptCost", .. })
        ));
    }

    #[test]
    fn validate_rejects_sqlite_without_path() {
        let mut s = valid();
        s.store.backend = StoreBackend::Sqlite;
        s.store.path = String::new();
        assert!(s.validate().is_err());
    }
}
