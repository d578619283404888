use std::time::Duration;

/// Failure of a single upstream chat request.
///
/// Every variant ends the request; none of them says anything about
/// the client connection the request came from.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("rate limited")]
    RateLimited,
    #[error("upstream error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ChatError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::RateLimited => "rate_limited",
            Self::Status { .. } => "status",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a non-success HTTP status from the upstream endpoint.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            429 => Self::RateLimited,
            _ => Self::Status { status, body },
        }
    }
}
