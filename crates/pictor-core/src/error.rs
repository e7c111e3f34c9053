//! Error types for the generation core

use thiserror::Error;

/// Errors raised by the core domain types
#[derive(Debug, Error)]
pub enum CoreError {
    /// Generation configuration could not be decoded
    #[error("Invalid generation configuration: {0}")]
    InvalidConfiguration(String),

    /// Model store error
    #[error("Model store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors reported by a worker queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// The worker thread could not be started
    #[error("Failed to start worker queue {name}: {reason}")]
    Spawn { name: String, reason: String },

    /// The queue no longer accepts jobs
    #[error("Worker queue {0} is closed")]
    Closed(String),

    /// The job panicked while running
    #[error("Job panicked on worker queue {queue}: {message}")]
    JobPanicked { queue: String, message: String },
}

/// Errors reported by the compute collaborator
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// Referenced model is not available locally
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Input payload could not be used
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Any other failure inside the generator
    #[error("Generation failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::JobPanicked {
            queue: "primary".to_string(),
            message: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("primary"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_generator_error_display() {
        let err = GeneratorError::ModelNotFound("sd_v1.5_f16.ckpt".to_string());
        assert!(err.to_string().contains("sd_v1.5_f16.ckpt"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CoreError>();
        assert_send_sync::<QueueError>();
        assert_send_sync::<GeneratorError>();
    }
}
