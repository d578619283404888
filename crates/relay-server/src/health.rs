//! `/health` and `/api/status` bodies.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}

/// `GET /api/status` body.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub code: u16,
    pub connections: usize,
}

impl StatusResponse {
    pub fn new(connections: usize) -> Self {
        Self {
            code: 200,
            connections,
        }
    }
}
