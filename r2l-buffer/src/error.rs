use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("shape mismatch at `{key}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("key mismatch: expected keys {expected:?}, got {actual:?}")]
    KeyMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("no entry named `{0}`")]
    MissingKey(String),
    #[error("index {index} out of range for dimension {dim} of size {size}")]
    OutOfRange {
        dim: usize,
        index: usize,
        size: usize,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, BufferError>;
