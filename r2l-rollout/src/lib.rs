//! Experience storage for recurrent on-policy trainers.
//!
//! [`RolloutStorage`] keeps `num_steps + 1` timesteps for every simulator in a single
//! [`NestedBuffer`](r2l_buffer::NestedBuffer), computes return targets in place and hands out
//! shuffled, simulator-partitioned mini-batches.

pub mod config;
pub mod error;
pub mod rng;
pub mod spaces;
pub mod tensors;
pub mod utils;

pub use config::{RolloutStorageBuilder, RolloutStorageConfig};
pub use error::{Result, RolloutError};
pub use spaces::{ActionSpace, ObservationSpace, SensorSpec};
pub use tensors::Advantages;
pub use utils::{
    mini_batching::RecurrentGenerator,
    returns::ReturnEstimator,
    rollout_buffer::{RolloutStorage, StepInsert, keys},
};
