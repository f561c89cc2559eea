use std::sync::PoisonError;

use thiserror::Error;
use tokio::task::JoinError;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("invalid operation state: expected {expected}, actual {actual}")]
    InvalidOperationState { expected: String, actual: String },
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<JoinError> for ControllerError {
    fn from(error: JoinError) -> Self {
        ControllerError::InternalError(error.to_string())
    }
}

impl<T> From<PoisonError<T>> for ControllerError {
    fn from(error: PoisonError<T>) -> Self {
        ControllerError::InternalError(error.to_string())
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(error: serde_json::Error) -> Self {
        ControllerError::MalformedSnapshot(error.to_string())
    }
}

impl From<keel_common::error::CommonError> for ControllerError {
    fn from(error: keel_common::error::CommonError) -> Self {
        ControllerError::InternalError(error.to_string())
    }
}
