use faceid_vecstore::VecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("facestore: dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("facestore: non-finite embedding component at position {0}")]
    NonFinite(usize),

    #[error("facestore: identity {0:?} already enrolled")]
    DuplicateIdentity(String),

    #[error("facestore: identity {0:?} not found")]
    NotFound(String),

    #[error("facestore: invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("facestore: corrupt state: {0}")]
    CorruptState(String),

    #[error("facestore: index error: {0}")]
    Index(VecError),

    #[error("facestore: kv error: {0}")]
    KV(#[from] faceid_kv::KVError),

    #[error("facestore: io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VecError> for StoreError {
    fn from(e: VecError) -> Self {
        match e {
            VecError::DimensionMismatch { got, want } => StoreError::DimensionMismatch { got, want },
            VecError::NonFinite(pos) => StoreError::NonFinite(pos),
            other => StoreError::Index(other),
        }
    }
}
