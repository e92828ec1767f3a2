pub mod mini_batching;
pub mod returns;
pub mod rollout_buffer;
