//! Server configuration.

use std::time::Duration;

use relay_core::DEFAULT_IMAGE_PROMPT;
use relay_settings::RelaySettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Deadline for one upstream chat request, all chunks included.
    pub request_timeout_secs: u64,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without any inbound frame.
    pub heartbeat_timeout_secs: u64,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Max WebSocket message / HTTP body size in bytes.
    pub max_message_size: usize,
    /// Tie in-flight chat requests to their connection's lifetime.
    pub cancel_on_disconnect: bool,
    /// Prompt for image turns that carry none.
    pub image_prompt: String,
    /// How long shutdown waits for the listener and sessions to finish.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            request_timeout_secs: 60,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            send_queue_capacity: 256,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            cancel_on_disconnect: false,
            image_prompt: DEFAULT_IMAGE_PROMPT.into(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &RelaySettings) -> Self {
        let server = &settings.server;
        let image_prompt = if settings.ai.image_prompt.trim().is_empty() {
            DEFAULT_IMAGE_PROMPT.to_owned()
        } else {
            settings.ai.image_prompt.clone()
        };
        Self {
            host: server.host.clone(),
            port: server.port,
            request_timeout_secs: server.request_timeout_secs,
            heartbeat_interval_secs: server.heartbeat_interval_secs,
            heartbeat_timeout_secs: server.heartbeat_timeout_secs,
            send_queue_capacity: server.send_queue_capacity,
            max_message_size: server.max_message_bytes,
            cancel_on_disconnect: server.cancel_on_disconnect,
            image_prompt,
            shutdown_timeout_secs: server.shutdown_timeout_secs,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.request_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.send_queue_capacity, 256);
        assert!(!cfg.cancel_on_disconnect);
        assert_eq!(cfg.image_prompt, DEFAULT_IMAGE_PROMPT);
    }

    #[test]
    fn from_settings_copies_server_section() {
        let mut settings = RelaySettings::default();
        settings.server.port = 9001;
        settings.server.request_timeout_secs = 5;
        settings.server.cancel_on_disconnect = true;
        settings.server.shutdown_timeout_secs = 3;
        settings.ai.image_prompt = "What is in the picture?".into();

        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9001");
        assert_eq!(cfg.request_timeout(), Duration::from_secs(5));
        assert!(cfg.cancel_on_disconnect);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.image_prompt, "What is in the picture?");
    }

    #[test]
    fn blank_image_prompt_falls_back() {
        let mut settings = RelaySettings::default();
        settings.ai.image_prompt = "  ".into();
        assert_eq!(ServerConfig::from_settings(&settings).image_prompt, DEFAULT_IMAGE_PROMPT);
    }

    #[test]
    fn heartbeat_interval_never_zero() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
    }
}
