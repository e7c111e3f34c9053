//! Service error type and its mapping to gRPC status.

use pictor_core::{CoreError, GeneratorError, QueueError};
use pictor_rewriter::RewriteError;
use thiserror::Error;
use tonic::Status;

/// Errors terminating an RPC
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Shared secret missing or wrong
    #[error("Shared secret mismatch")]
    Unauthenticated,

    /// Request payload could not be used
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced asset could not be made available
    #[error("Cannot load model: {0}")]
    CannotLoadModel(String),

    /// Compute collaborator failed
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Compute collaborator produced nothing for a live request
    #[error("Generation produced no images")]
    EmptyResult,

    /// Uploaded bytes do not match what was announced
    #[error("{0}")]
    DataLoss(String),

    /// Worker lane unavailable
    #[error("Worker queue error: {0}")]
    Queue(#[from] QueueError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// Metrics label for the failure class
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthenticated => "unauthenticated",
            ServiceError::InvalidArgument(_) => "invalid_argument",
            ServiceError::CannotLoadModel(_) => "cannot_load_model",
            ServiceError::Generation(_) => "generation",
            ServiceError::EmptyResult => "empty_result",
            ServiceError::DataLoss(_) => "data_loss",
            ServiceError::Queue(_) => "queue",
            ServiceError::Io(_) => "io",
        }
    }

    /// Terminal RPC status for this error
    pub fn to_status(&self) -> Status {
        let message = self.to_string();
        match self {
            ServiceError::Unauthenticated => Status::unauthenticated(message),
            ServiceError::InvalidArgument(_) => Status::invalid_argument(message),
            ServiceError::CannotLoadModel(_) => Status::failed_precondition(message),
            ServiceError::DataLoss(_) => Status::data_loss(message),
            ServiceError::Generation(_)
            | ServiceError::EmptyResult
            | ServiceError::Queue(_)
            | ServiceError::Io(_) => Status::internal(message),
        }
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        err.to_status()
    }
}

impl From<CoreError> for ServiceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidConfiguration(reason) => ServiceError::InvalidArgument(reason),
            CoreError::Io(e) => ServiceError::Io(e),
            other => ServiceError::Generation(other.to_string()),
        }
    }
}

impl From<GeneratorError> for ServiceError {
    fn from(err: GeneratorError) -> Self {
        match err {
            GeneratorError::ModelNotFound(model) => ServiceError::CannotLoadModel(model),
            other => ServiceError::Generation(other.to_string()),
        }
    }
}

impl From<RewriteError> for ServiceError {
    fn from(err: RewriteError) -> Self {
        match err {
            RewriteError::CannotLoadModel(asset) => ServiceError::CannotLoadModel(asset),
            RewriteError::Cancelled => ServiceError::Generation("Cancelled".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ServiceError::Unauthenticated, Code::Unauthenticated),
            (
                ServiceError::InvalidArgument("bad".into()),
                Code::InvalidArgument,
            ),
            (
                ServiceError::CannotLoadModel("lora".into()),
                Code::FailedPrecondition,
            ),
            (ServiceError::EmptyResult, Code::Internal),
            (
                ServiceError::DataLoss("File validation failed".into()),
                Code::DataLoss,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn test_rewrite_failure_names_asset() {
        let status = Status::from(ServiceError::from(RewriteError::CannotLoadModel(
            "abc_lora".into(),
        )));
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert!(status.message().contains("abc_lora"));
    }

    #[test]
    fn test_model_not_found_maps_to_precondition() {
        let err = ServiceError::from(GeneratorError::ModelNotFound("sd_v1.5_f16.ckpt".into()));
        assert_eq!(err.kind(), "cannot_load_model");
    }
}
