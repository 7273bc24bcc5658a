use thiserror::Error;

/// Application-wide error types for Harvest.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request could not be built or sent.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Upstream answered with a non-success status.
    #[error("Upstream error (HTTP {status_code}): {message}")]
    UpstreamError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Upstream answered, but the payload failed validation.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Upstream rejected the request with a rate limit.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Call short-circuited by an open endpoint circuit.
    #[error("Circuit for endpoint '{endpoint}' is open, retry after {retry_after_secs} seconds")]
    CircuitOpen {
        endpoint: String,
        retry_after_secs: u64,
    },

    /// Downstream compute step failed.
    #[error("Compute error: {0}")]
    ComputeError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Snapshot export failed.
    #[error("Export error: {0}")]
    ExportError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation not allowed in the current scheduler state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying on a later tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::CircuitOpen { .. } => true,
            AppError::UpstreamError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true for upstream failures that retrying will not fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            AppError::MalformedResponse(_) => true,
            AppError::UpstreamError { retryable, .. } => !*retryable,
            _ => false,
        }
    }

    /// Returns true if this error should count against an endpoint circuit.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::UpstreamError {
                status_code,
                retryable,
                ..
            } => *status_code == 429 || *status_code >= 500 || *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }
}
