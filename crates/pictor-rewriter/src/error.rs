//! Error types for configuration rewriting

use thiserror::Error;

/// Result type for rewrites
pub type Result<T> = std::result::Result<T, RewriteError>;

/// Errors raised while rewriting a configuration
#[derive(Debug, Error)]
pub enum RewriteError {
    /// A referenced asset could not be made available locally
    #[error("Cannot load model: {0}")]
    CannotLoadModel(String),

    /// The request was cancelled while assets were being fetched
    #[error("Configuration rewrite cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_asset() {
        let err = RewriteError::CannotLoadModel("abc_lora".to_string());
        assert_eq!(err.to_string(), "Cannot load model: abc_lora");
    }
}
