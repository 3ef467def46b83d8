use crate::FaceError;

/// Extracts face embedding vectors from encoded images.
///
/// The input is the raw encoded image as received from a client (JPEG,
/// PNG, ...). Detection and alignment happen inside the implementation.
/// The output is a dense f32 vector whose length should equal
/// [`FaceModel::dimension`]; callers validate it rather than trust it.
///
/// # Thread Safety
///
/// Implementations must be safe for concurrent use. Calls are CPU-bound
/// or blocking and must not be made from an async executor thread.
pub trait FaceModel: Send + Sync {
    /// Computes an embedding for the single face in `image`.
    fn embed(&self, image: &[u8]) -> Result<Vec<f32>, FaceError>;

    /// Returns the dimensionality of the embedding vectors (e.g., 512).
    fn dimension(&self) -> usize;
}
