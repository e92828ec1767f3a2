use crate::{
    error::{Result, RolloutError},
    rng::RNG,
    tensors::Advantages,
    utils::rollout_buffer::keys,
};
use r2l_buffer::{BufferError, NestedBuffer, Selector};
use rand::seq::SliceRandom;
use tracing::warn;

/// Splits `indices` into `parts` contiguous chunks whose sizes differ by at most one, the last
/// chunks taking the remainder.
pub fn partition(indices: &[usize], parts: usize) -> Vec<Vec<usize>> {
    if parts == 0 {
        return vec![];
    }
    let base = indices.len() / parts;
    let remainder = indices.len() % parts;
    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for part in 0..parts {
        let len = if part >= parts - remainder { base + 1 } else { base };
        chunks.push(indices[start..start + len].to_vec());
        start += len;
    }
    chunks
}

/// Mini-batches over a rollout, one per random group of simulators.
///
/// Every batch holds all collected timesteps of its simulators with the time and simulator
/// dimensions flattened into one, the matching `advantages`, and only the first recurrent hidden
/// state of each simulator. The permutation is drawn on construction, so a generator cannot be
/// restarted; ask the storage for a new one every epoch.
pub struct RecurrentGenerator<'a> {
    buffers: &'a NestedBuffer,
    advantages: NestedBuffer,
    step: usize,
    chunks: std::vec::IntoIter<Vec<usize>>,
    uneven: bool,
}

impl<'a> RecurrentGenerator<'a> {
    pub(crate) fn new(
        buffers: &'a NestedBuffer,
        advantages: &Advantages,
        step: usize,
        num_mini_batch: usize,
    ) -> Result<Self> {
        let num_simulators = advantages.num_simulators();
        if num_mini_batch == 0 || num_simulators < num_mini_batch {
            return Err(RolloutError::InsufficientSimulators {
                num_simulators,
                num_mini_batch,
            });
        }
        let (_, num_envs) = buffers.leading_dims()?;
        if num_simulators != num_envs {
            return Err(BufferError::ShapeMismatch {
                key: keys::ADVANTAGES.to_owned(),
                expected: vec![step, num_envs, 1],
                actual: advantages.dims().to_vec(),
            }
            .into());
        }
        let uneven = num_simulators % num_mini_batch != 0;
        if uneven {
            warn!(
                num_simulators,
                num_mini_batch,
                "number of simulators is not a multiple of the number of mini batches"
            );
        }

        let mut permutation = (0..num_simulators).collect::<Vec<_>>();
        RNG.with_borrow_mut(|rng| permutation.shuffle(rng));
        let chunks = partition(&permutation, num_mini_batch);
        Ok(Self {
            buffers,
            advantages: NestedBuffer::new().with(keys::ADVANTAGES, advantages.0.clone()),
            step,
            chunks: chunks.into_iter(),
            uneven,
        })
    }

    /// Whether the simulators could not be split into equally sized batches.
    pub fn is_uneven(&self) -> bool {
        self.uneven
    }

    fn batch(&self, simulators: Vec<usize>) -> Result<NestedBuffer> {
        let selector = Selector::new(0..self.step, simulators);
        let mut batch = self.buffers.get(selector.clone())?;
        let advantages = self.advantages.get(selector)?;
        batch.insert(keys::ADVANTAGES, advantages.leaf(keys::ADVANTAGES)?.clone());
        // an empty rollout yields empty batches
        let hidden = batch
            .leaf(keys::RECURRENT_HIDDEN_STATES)?
            .narrow(0, 0, self.step.min(1))?;
        batch.insert(keys::RECURRENT_HIDDEN_STATES, hidden);
        Ok(batch.map(|t| t.flatten(0, 1))?)
    }
}

impl Iterator for RecurrentGenerator<'_> {
    type Item = Result<NestedBuffer>;

    fn next(&mut self) -> Option<Self::Item> {
        let simulators = self.chunks.next()?;
        Some(self.batch(simulators))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for RecurrentGenerator<'_> {}
