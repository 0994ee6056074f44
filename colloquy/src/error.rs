// Error handling for the gateway runtime

/// Result alias used across the gateway crates.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur while running the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Configuration errors (bad addresses, missing env vars, invalid limits)
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Network errors (bind failures, outbound dispatch failures)
    #[error("Network error: {0}")]
    Network(String),

    /// JSON/TOML encoding or decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Caller could not be authenticated
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Outbound dispatch rate limit exceeded
    #[error("Dispatch rate limit exceeded")]
    RateLimited,

    /// Session lookup failed
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Run lookup failed
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Custom application errors
    #[error("{0}")]
    Generic(String),
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}
