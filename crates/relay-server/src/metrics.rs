//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup,
/// before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// WebSocket handshakes rejected for bad credentials (counter).
pub const WS_AUTH_REJECTED_TOTAL: &str = "ws_auth_rejected_total";
/// Broker broadcasts total (counter).
pub const BROADCASTS_TOTAL: &str = "broadcasts_total";
/// Connections pruned after a failed broadcast write (counter).
pub const BROADCAST_PRUNED_TOTAL: &str = "broadcast_pruned_total";
/// Chat requests total (counter, labels: kind, transport).
pub const CHAT_REQUESTS_TOTAL: &str = "chat_requests_total";
/// Chat request failures total (counter, labels: transport, error_kind).
pub const CHAT_ERRORS_TOTAL: &str = "chat_errors_total";
/// Chunks relayed to clients (counter, labels: transport).
pub const CHAT_CHUNKS_TOTAL: &str = "chat_chunks_total";
/// Chat request duration seconds (histogram, labels: transport).
pub const CHAT_DURATION_SECONDS: &str = "chat_duration_seconds";
/// Messages submitted over HTTP (counter, labels: kind).
pub const HTTP_MESSAGES_TOTAL: &str = "http_messages_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            WS_AUTH_REJECTED_TOTAL,
            BROADCASTS_TOTAL,
            BROADCAST_PRUNED_TOTAL,
            CHAT_REQUESTS_TOTAL,
            CHAT_ERRORS_TOTAL,
            CHAT_CHUNKS_TOTAL,
            CHAT_DURATION_SECONDS,
            HTTP_MESSAGES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
