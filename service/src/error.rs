use std::time::Duration;

use faceid_face::FaceError;
use faceid_facestore::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("service: embedding failed: {0}")]
    Embedding(#[from] FaceError),

    #[error("service: timed out after {0:?}")]
    Timeout(Duration),

    #[error("service: dispatcher is shut down")]
    Closed,

    #[error("service: worker failed: {0}")]
    Worker(String),

    #[error("service: invalid input: {0}")]
    InvalidInput(String),

    #[error("service: config error: {0}")]
    Config(String),
}

impl ServiceError {
    /// Stable machine-readable name of the error kind, used in responses.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Store(e) => match e {
                StoreError::DimensionMismatch { .. } => "dimension_mismatch",
                StoreError::NonFinite(_) => "invalid_embedding",
                StoreError::DuplicateIdentity(_) => "duplicate_identity",
                StoreError::NotFound(_) => "not_found",
                StoreError::InvalidIdentity(_) => "invalid_identity",
                StoreError::CorruptState(_) => "corrupt_state",
                StoreError::Index(_) | StoreError::KV(_) | StoreError::Io(_) => "storage",
            },
            ServiceError::Embedding(e) => match e {
                FaceError::NoFaceDetected => "no_face_detected",
                FaceError::AlignmentFailed(_) => "alignment_failed",
                FaceError::InvalidImage(_) => "invalid_image",
                FaceError::Model(_) => "model_error",
            },
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Closed => "unavailable",
            ServiceError::Worker(_) => "worker_failed",
            ServiceError::InvalidInput(_) => "invalid_input",
            ServiceError::Config(_) => "config",
        }
    }
}
