use thiserror::Error;

#[derive(Error, Debug)]
pub enum VecError {
    #[error("vecstore: dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("vecstore: slot {slot} out of range (count {count})")]
    SlotOutOfRange { slot: usize, count: usize },

    #[error("vecstore: non-finite component at position {0}")]
    NonFinite(usize),

    #[error("vecstore: {0}")]
    Io(String),

    #[error("vecstore: invalid format: {0}")]
    InvalidFormat(String),
}
