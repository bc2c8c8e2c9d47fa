//! Error types for ip-sentinel

use thiserror::Error;

/// Guard error type
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Shared store unavailable or command failed
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// No valid client IP could be derived from the request
    #[error("invalid client IP")]
    InvalidClientIp,

    /// Session or device cookie failed verification
    #[error("cookie invalid: {0}")]
    CookieInvalid(String),

    /// GeoIP lookup not possible
    #[error("geo unavailable: {0}")]
    GeoUnavailable(String),

    /// JSON serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SMTP notification failed
    #[error("SMTP error: {0}")]
    Smtp(String),
}

/// Result type for ip-sentinel
pub type GuardResult<T> = Result<T, GuardError>;
