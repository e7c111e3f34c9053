//! Error types for object-storage operations

use thiserror::Error;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur while talking to object storage
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Server answered with a non-success status
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Connection dropped, refused, or the body ended early
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Request timed out
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Endpoint or key did not form a valid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Object does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Downloaded content hashes differently than expected
    #[error("Checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// Downloaded content has the wrong length
    #[error("Size mismatch for {key}: expected {expected} bytes, got {actual}")]
    SizeMismatch { key: String, expected: u64, actual: u64 },

    /// Too many consecutive transient failures
    #[error("All retries exhausted: {0}")]
    RetriesExhausted(String),

    /// Client configuration error
    #[error("Object store configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Download task ended abnormally
    #[error("Download task failed: {0}")]
    Task(String),

    /// Cancelled
    #[error("Request cancelled")]
    Cancelled,
}

impl NetworkError {
    /// Whether the failure is transient and the request may be resumed
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::Connection(_) | NetworkError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NetworkError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_body() || e.is_decode() || e.is_request() {
            NetworkError::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            NetworkError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_builder() {
            NetworkError::Configuration(e.to_string())
        } else {
            NetworkError::Connection(e.to_string())
        }
    }
}

impl From<url::ParseError> for NetworkError {
    fn from(e: url::ParseError) -> Self {
        NetworkError::InvalidUrl(e.to_string())
    }
}
