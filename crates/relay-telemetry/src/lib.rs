//! Tracing setup for the relay binary.
//!
//! The subscriber is built explicitly from a [`TelemetryConfig`] and handed
//! back as a [`Dispatch`]; the binary installs it once at startup, tests can
//! scope one with `tracing::dispatcher::with_default`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{Dispatch, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Output encoding for log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(TelemetryError::InvalidFormat(other.to_string())),
        }
    }
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    #[error("invalid log format: {0}")]
    InvalidFormat(String),
    #[error("global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Parse a level name such as `info` or `DEBUG`.
pub fn parse_level(s: &str) -> Result<Level, TelemetryError> {
    Level::from_str(s.trim()).map_err(|_| TelemetryError::InvalidLevel(s.to_string()))
}

/// Render the filter directive string for `config`.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// Build the subscriber described by `config` without installing it.
pub fn build_dispatch(config: &TelemetryConfig) -> Dispatch {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(fmt_layer.with_filter(env_filter));
    Dispatch::new(subscriber)
}

/// Build and install the process subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    tracing::dispatcher::set_global_default(build_dispatch(config))
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}
