use crate::{
    config::RolloutStorageConfig,
    error::{Result, RolloutError},
    spaces::{ActionSpace, ObservationSpace},
    tensors::Advantages,
    utils::{mini_batching::RecurrentGenerator, returns::ReturnEstimator},
};
use candle_core::{DType, Device, Tensor};
use r2l_buffer::{NestedBuffer, Selector};
use std::ops::Range;
use tracing::{debug, trace};

/// Field names of the rollout schema.
pub mod keys {
    pub const OBSERVATIONS: &str = "observations";
    pub const RECURRENT_HIDDEN_STATES: &str = "recurrent_hidden_states";
    pub const REWARDS: &str = "rewards";
    pub const VALUE_PREDS: &str = "value_preds";
    pub const RETURNS: &str = "returns";
    pub const ACTION_LOG_PROBS: &str = "action_log_probs";
    pub const ACTIONS: &str = "actions";
    pub const PREV_ACTIONS: &str = "prev_actions";
    pub const MASKS: &str = "masks";
    pub const ADVANTAGES: &str = "advantages";
}

/// The fields produced by one environment step. Absent fields are not written.
///
/// Shapes are those of a single timestep for the simulators of one buffer half, e.g. rewards are
/// `[N / B, 1]`.
#[derive(Debug, Clone, Default)]
pub struct StepInsert {
    pub observations: Option<NestedBuffer>,
    pub recurrent_hidden_states: Option<Tensor>,
    pub actions: Option<Tensor>,
    pub action_log_probs: Option<Tensor>,
    pub value_preds: Option<Tensor>,
    pub rewards: Option<Tensor>,
    pub masks: Option<Tensor>,
}

impl StepInsert {
    // Splits into the fields stored at `cursor + 1` and the ones stored at `cursor`.
    fn split(self) -> (NestedBuffer, NestedBuffer) {
        let StepInsert {
            observations,
            recurrent_hidden_states,
            actions,
            action_log_probs,
            value_preds,
            rewards,
            masks,
        } = self;
        let mut next_step = NestedBuffer::new();
        if let Some(observations) = observations {
            next_step.insert(keys::OBSERVATIONS, observations);
        }
        if let Some(hidden) = recurrent_hidden_states {
            next_step.insert(keys::RECURRENT_HIDDEN_STATES, hidden);
        }
        if let Some(actions) = &actions {
            next_step.insert(keys::PREV_ACTIONS, actions.clone());
        }
        if let Some(masks) = masks {
            next_step.insert(keys::MASKS, masks);
        }
        let mut current_step = NestedBuffer::new();
        let current = [
            (keys::ACTIONS, actions),
            (keys::ACTION_LOG_PROBS, action_log_probs),
            (keys::VALUE_PREDS, value_preds),
            (keys::REWARDS, rewards),
        ];
        for (key, value) in current {
            if let Some(value) = value {
                current_step.insert(key, value);
            }
        }
        (next_step, current_step)
    }
}

/// Fixed size storage of `num_steps + 1` timesteps for `num_envs` simulators.
///
/// Slot 0 holds the bootstrap state of the rollout, slots `1..=num_steps` the transitions. With
/// double buffering the simulators are split into two contiguous halves that each own a write
/// cursor, so stepping one half can overlap with inference on the other. The halves write to
/// disjoint simulator ranges; anything touching every simulator (`after_update`,
/// `compute_returns`) must be serialized by the caller and requires the cursors to agree.
#[derive(Debug)]
pub struct RolloutStorage {
    buffers: NestedBuffer,
    num_steps: usize,
    num_envs: usize,
    num_buffers: usize,
    steps: Vec<usize>,
    device: Device,
}

impl RolloutStorage {
    pub fn new(
        config: &RolloutStorageConfig,
        observation_space: &ObservationSpace,
        action_space: &ActionSpace,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let RolloutStorageConfig {
            num_steps,
            num_envs,
            recurrent_hidden_state_size,
            num_recurrent_layers,
            ..
        } = *config;
        let slots = num_steps + 1;

        let mut observations = NestedBuffer::new();
        for (name, sensor) in observation_space.sensors() {
            let mut shape = vec![slots, num_envs];
            shape.extend_from_slice(&sensor.shape);
            let leaf = Tensor::zeros(shape, sensor.dtype.to_candle_dtype(), device)?;
            observations.insert(name, leaf);
        }

        let scalar = || Tensor::zeros((slots, num_envs, 1), DType::F32, device);
        let action_dtype = action_space.dtype().to_candle_dtype();
        let action = || Tensor::zeros((slots, num_envs, action_space.width()), action_dtype, device);
        let buffers = NestedBuffer::new()
            .with(keys::OBSERVATIONS, observations)
            .with(
                keys::RECURRENT_HIDDEN_STATES,
                Tensor::zeros(
                    (slots, num_envs, num_recurrent_layers, recurrent_hidden_state_size),
                    DType::F32,
                    device,
                )?,
            )
            .with(keys::REWARDS, scalar()?)
            .with(keys::VALUE_PREDS, scalar()?)
            .with(keys::RETURNS, scalar()?)
            .with(keys::ACTION_LOG_PROBS, scalar()?)
            .with(keys::ACTIONS, action()?)
            .with(keys::PREV_ACTIONS, action()?)
            .with(
                keys::MASKS,
                Tensor::zeros((slots, num_envs, 1), DType::U8, device)?,
            );

        let num_buffers = config.num_buffers();
        debug!(
            num_steps,
            num_envs,
            num_buffers,
            sensors = observation_space.len(),
            ?device,
            "allocated rollout storage"
        );
        Ok(Self {
            buffers,
            num_steps,
            num_envs,
            num_buffers,
            steps: vec![0; num_buffers],
            device: device.clone(),
        })
    }

    pub fn buffers(&self) -> &NestedBuffer {
        &self.buffers
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn is_double_buffered(&self) -> bool {
        self.num_buffers > 1
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Write cursor of every buffer half.
    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    /// The common cursor of all buffer halves.
    pub fn step(&self) -> Result<usize> {
        match self.steps.split_first() {
            Some((first, rest)) if rest.iter().all(|s| s == first) => Ok(*first),
            _ => Err(RolloutError::CursorMismatch(self.steps.clone())),
        }
    }

    fn check_buffer_index(&self, buffer_index: usize) -> Result<()> {
        if buffer_index >= self.num_buffers {
            return Err(RolloutError::InvalidBufferIndex {
                index: buffer_index,
                num_buffers: self.num_buffers,
            });
        }
        Ok(())
    }

    /// Simulators owned by a buffer half.
    pub fn env_slice(&self, buffer_index: usize) -> Result<Range<usize>> {
        self.check_buffer_index(buffer_index)?;
        let per_buffer = self.num_envs / self.num_buffers;
        Ok(buffer_index * per_buffer..(buffer_index + 1) * per_buffer)
    }

    /// Moves every field to `device`.
    pub fn to(&mut self, device: &Device) -> Result<()> {
        self.buffers.map_in_place(|t| t.to_device(device))?;
        self.device = device.clone();
        Ok(())
    }

    /// Stores one environment step for the simulators of `buffer_index`.
    ///
    /// Observations, recurrent states, masks and the actions (as `prev_actions`) land in the next
    /// slot, actions, log probabilities, value predictions and rewards in the current one.
    pub fn insert(&mut self, fields: StepInsert, buffer_index: usize) -> Result<()> {
        let env_slice = self.env_slice(buffer_index)?;
        let step = self.steps[buffer_index];
        let (next_step, current_step) = fields.split();
        // both slots commit together or not at all
        let mut staged = self.buffers.clone();
        if !next_step.is_empty() {
            staged.set(
                Selector::new(step + 1, env_slice.clone()),
                &next_step,
                false,
            )?;
        }
        if !current_step.is_empty() {
            staged.set(Selector::new(step, env_slice), &current_step, false)?;
        }
        self.buffers = staged;
        Ok(())
    }

    /// Moves the cursor of a buffer half forward.
    ///
    /// Advancing past `num_steps` is not checked here, the next `insert` fails instead.
    pub fn advance(&mut self, buffer_index: usize) -> Result<()> {
        self.check_buffer_index(buffer_index)?;
        self.steps[buffer_index] += 1;
        trace!(buffer_index, step = self.steps[buffer_index], "advanced rollout");
        Ok(())
    }

    /// The slot at the cursor of a buffer half, i.e. the input of the next policy step.
    pub fn current_step(&self, buffer_index: usize) -> Result<NestedBuffer> {
        let env_slice = self.env_slice(buffer_index)?;
        let step = self.steps[buffer_index];
        Ok(self.buffers.get(Selector::new(step, env_slice))?)
    }

    /// Makes the last collected slot the bootstrap slot of the next rollout and rewinds the
    /// cursors.
    pub fn after_update(&mut self) -> Result<()> {
        let step = self.step()?;
        self.buffers.copy_slot(0, step)?;
        self.steps.iter_mut().for_each(|s| *s = 0);
        trace!(step, "wrapped rollout");
        Ok(())
    }

    /// Fills `returns` for the collected rollout, bootstrapping from `next_value` (`[N, 1]`).
    pub fn compute_returns(
        &mut self,
        next_value: &Tensor,
        use_gae: bool,
        gamma: f64,
        tau: f64,
    ) -> Result<()> {
        let step = self.step()?;
        ReturnEstimator::from_flags(use_gae, gamma, tau).compute(&mut self.buffers, step, next_value)
    }

    /// `returns - value_preds` over the collected rollout, optionally normalized.
    pub fn compute_advantages(&self, normalize: bool) -> Result<Advantages> {
        let step = self.step()?;
        let returns = self.buffers.leaf(keys::RETURNS)?.narrow(0, 0, step)?;
        let values = self.buffers.leaf(keys::VALUE_PREDS)?.narrow(0, 0, step)?;
        let mut advantages = returns.sub(&values)?;
        if normalize {
            let mean = advantages.mean_all()?;
            let centered = advantages.broadcast_sub(&mean)?;
            let std = centered.sqr()?.mean_all()?.sqrt()?.affine(1., 1e-8)?;
            advantages = centered.broadcast_div(&std)?;
        }
        Ok(Advantages(advantages))
    }

    /// Shuffled mini-batches over the collected rollout, one per simulator group.
    pub fn recurrent_generator(
        &self,
        advantages: &Advantages,
        num_mini_batch: usize,
    ) -> Result<RecurrentGenerator<'_>> {
        let step = self.step()?;
        RecurrentGenerator::new(&self.buffers, advantages, step, num_mini_batch)
    }
}
