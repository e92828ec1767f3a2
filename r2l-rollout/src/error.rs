use r2l_buffer::BufferError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("buffer index {index} is invalid for {num_buffers} buffer(s)")]
    InvalidBufferIndex { index: usize, num_buffers: usize },
    #[error(
        "trainer requires the number of simulators ({num_simulators}) to be greater than or equal \
         to the number of trainer mini batches ({num_mini_batch})"
    )]
    InsufficientSimulators {
        num_simulators: usize,
        num_mini_batch: usize,
    },
    #[error("buffer cursors disagree: {0:?}")]
    CursorMismatch(Vec<usize>),
    #[error("invalid rollout configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, RolloutError>;
