use crate::{error::Result, utils::rollout_buffer::keys};
use candle_core::Tensor;
use r2l_buffer::NestedBuffer;

/// How return targets are bootstrapped from the value of the state after the rollout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnEstimator {
    /// Generalized advantage estimation, `returns = gae + value_preds`.
    Gae { gamma: f64, tau: f64 },
    /// Plain discounted n-step return.
    Discounted { gamma: f64 },
}

impl ReturnEstimator {
    pub fn from_flags(use_gae: bool, gamma: f64, tau: f64) -> Self {
        if use_gae {
            Self::Gae { gamma, tau }
        } else {
            Self::Discounted { gamma }
        }
    }

    pub fn gamma(&self) -> f64 {
        match self {
            Self::Gae { gamma, .. } | Self::Discounted { gamma } => *gamma,
        }
    }

    /// Writes `returns[0..step]` of a rollout buffer in place.
    ///
    /// GAE also stores `next_value` as `value_preds[step]`, the discounted return stores it as
    /// `returns[step]`. A zero mask at `t + 1` cuts everything bootstrapped from beyond `t`. Each
    /// step depends on the next one, so the recursion has to run backwards in time.
    pub fn compute(&self, buffers: &mut NestedBuffer, step: usize, next_value: &Tensor) -> Result<()> {
        let returns = buffers.leaf(keys::RETURNS)?.clone();
        let rewards = buffers.leaf(keys::REWARDS)?;
        let dtype = returns.dtype();
        let device = returns.device();
        let num_envs = returns.dim(1)?;
        let masks = buffers.leaf(keys::MASKS)?.to_dtype(dtype)?;
        let next_value = next_value
            .to_dtype(dtype)?
            .to_device(device)?
            .reshape((num_envs, 1))?;

        let mut rows = Vec::with_capacity(step + 1);
        match *self {
            Self::Gae { gamma, tau } => {
                let value_preds = buffers.leaf(keys::VALUE_PREDS)?.slice_assign(
                    &[step..step + 1, 0..num_envs, 0..1],
                    &next_value.unsqueeze(0)?,
                )?;
                let mut gae = Tensor::zeros((num_envs, 1), dtype, device)?;
                for t in (0..step).rev() {
                    let next_mask = masks.get(t + 1)?;
                    let value = value_preds.get(t)?;
                    let bootstrap = value_preds.get(t + 1)?.mul(&next_mask)?.affine(gamma, 0.)?;
                    let delta = rewards.get(t)?.add(&bootstrap)?.sub(&value)?;
                    gae = delta.add(&gae.mul(&next_mask)?.affine(gamma * tau, 0.)?)?;
                    rows.push(gae.add(&value)?);
                }
                rows.reverse();
                let returns = write_rows(&returns, &rows)?;
                buffers.replace_leaf(keys::VALUE_PREDS, value_preds)?;
                buffers.replace_leaf(keys::RETURNS, returns)?;
            }
            Self::Discounted { gamma } => {
                let mut running = next_value.clone();
                rows.push(next_value);
                for t in (0..step).rev() {
                    let next_mask = masks.get(t + 1)?;
                    running = running
                        .mul(&next_mask)?
                        .affine(gamma, 0.)?
                        .add(&rewards.get(t)?)?;
                    rows.push(running.clone());
                }
                rows.reverse();
                let returns = write_rows(&returns, &rows)?;
                buffers.replace_leaf(keys::RETURNS, returns)?;
            }
        }
        Ok(())
    }
}

// Writes `rows` into the leading timesteps of a `[T + 1, N, 1]` field.
fn write_rows(field: &Tensor, rows: &[Tensor]) -> Result<Tensor> {
    if rows.is_empty() {
        return Ok(field.clone());
    }
    let stacked = Tensor::stack(rows, 0)?;
    let num_envs = field.dim(1)?;
    Ok(field.slice_assign(&[0..rows.len(), 0..num_envs, 0..1], &stacked)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn buffers(rewards: &[f32], values: &[f32], masks: &[u8]) -> candle_core::Result<NestedBuffer> {
        let device = Device::Cpu;
        let slots = masks.len();
        let mut rewards = rewards.to_vec();
        rewards.resize(slots, 0.);
        let mut values = values.to_vec();
        values.resize(slots, 0.);
        Ok(NestedBuffer::new()
            .with(keys::REWARDS, Tensor::from_vec(rewards, (slots, 1, 1), &device)?)
            .with(keys::VALUE_PREDS, Tensor::from_vec(values, (slots, 1, 1), &device)?)
            .with(keys::RETURNS, Tensor::zeros((slots, 1, 1), DType::F32, &device)?)
            .with(keys::MASKS, Tensor::from_vec(masks.to_vec(), (slots, 1, 1), &device)?))
    }

    fn returns(buffers: &NestedBuffer) -> anyhow::Result<Vec<f32>> {
        Ok(buffers.leaf(keys::RETURNS)?.flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn discounted_return_on_a_short_rollout() -> anyhow::Result<()> {
        let mut buffers = buffers(&[1., 2.], &[], &[1, 1, 1])?;
        let next_value = Tensor::new(&[[10f32]], &Device::Cpu)?;
        ReturnEstimator::Discounted { gamma: 0.5 }.compute(&mut buffers, 2, &next_value)?;
        // returns[1] = 2 + 0.5 * 10, returns[0] = 1 + 0.5 * 7
        assert_eq!(returns(&buffers)?, vec![4.5, 7., 10.]);
        Ok(())
    }

    #[test]
    fn gae_writes_bootstrap_value() -> anyhow::Result<()> {
        let mut buffers = buffers(&[1.], &[0.5], &[1, 1])?;
        let next_value = Tensor::new(&[[2f32]], &Device::Cpu)?;
        ReturnEstimator::Gae { gamma: 1., tau: 1. }.compute(&mut buffers, 1, &next_value)?;
        let values = buffers.leaf(keys::VALUE_PREDS)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values, vec![0.5, 2.]);
        // delta = 1 + 2 - 0.5, returns = delta + 0.5
        assert_eq!(returns(&buffers)?, vec![3., 0.]);
        Ok(())
    }

    #[test]
    fn empty_rollout_only_stores_bootstrap() -> anyhow::Result<()> {
        let mut buffers = buffers(&[], &[], &[1, 1])?;
        let next_value = Tensor::new(&[3f32], &Device::Cpu)?;
        ReturnEstimator::Discounted { gamma: 0.9 }.compute(&mut buffers, 0, &next_value)?;
        assert_eq!(returns(&buffers)?, vec![3., 0.]);
        Ok(())
    }

    #[test]
    fn flags_select_the_estimator() {
        assert_eq!(
            ReturnEstimator::from_flags(true, 0.99, 0.95),
            ReturnEstimator::Gae {
                gamma: 0.99,
                tau: 0.95
            }
        );
        assert_eq!(
            ReturnEstimator::from_flags(false, 0.99, 0.95),
            ReturnEstimator::Discounted { gamma: 0.99 }
        );
        assert_eq!(ReturnEstimator::from_flags(false, 0.9, 0.).gamma(), 0.9);
    }
}
