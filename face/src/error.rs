use thiserror::Error;

/// Errors returned by face embedding models.
#[derive(Debug, Error)]
pub enum FaceError {
    #[error("face: no face detected")]
    NoFaceDetected,

    #[error("face: alignment failed: {0}")]
    AlignmentFailed(String),

    #[error("face: invalid image: {0}")]
    InvalidImage(String),

    #[error("face: model error: {0}")]
    Model(String),
}
