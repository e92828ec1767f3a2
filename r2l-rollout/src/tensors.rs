use candle_core::Tensor;
use derive_more::{Deref, DerefMut};

/// Per timestep advantages shaped `[T', N, 1]` with `T'` at least the collected rollout length.
#[derive(Deref, DerefMut, Debug, Clone)]
pub struct Advantages(pub Tensor);

impl Advantages {
    pub fn num_simulators(&self) -> usize {
        self.0.dims().get(1).copied().unwrap_or(0)
    }
}

impl From<Tensor> for Advantages {
    fn from(value: Tensor) -> Self {
        Self(value)
    }
}
