use crate::{
    error::{Result, RolloutError},
    spaces::{ActionSpace, ObservationSpace},
    utils::rollout_buffer::RolloutStorage,
};
use candle_core::Device;
use r2l_buffer::DType;
use serde::{Deserialize, Serialize};

fn default_recurrent_layers() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutStorageConfig {
    /// Transitions collected per rollout, the storage keeps one extra bootstrap slot.
    pub num_steps: usize,
    pub num_envs: usize,
    pub recurrent_hidden_state_size: usize,
    #[serde(default = "default_recurrent_layers")]
    pub num_recurrent_layers: usize,
    #[serde(default)]
    pub double_buffered: bool,
}

impl Default for RolloutStorageConfig {
    fn default() -> Self {
        Self {
            num_steps: 128,
            num_envs: 4,
            recurrent_hidden_state_size: 512,
            num_recurrent_layers: default_recurrent_layers(),
            double_buffered: false,
        }
    }
}

impl RolloutStorageConfig {
    pub fn num_buffers(&self) -> usize {
        if self.double_buffered { 2 } else { 1 }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RolloutError::InvalidConfig(msg));
        if self.num_steps == 0 {
            return invalid("num_steps must be positive".to_owned());
        }
        if self.num_envs == 0 {
            return invalid("num_envs must be positive".to_owned());
        }
        if self.num_recurrent_layers == 0 || self.recurrent_hidden_state_size == 0 {
            return invalid("recurrent hidden state must not be empty".to_owned());
        }
        if self.num_envs % self.num_buffers() != 0 {
            return invalid(format!(
                "{} simulators cannot be split into {} buffers",
                self.num_envs,
                self.num_buffers()
            ));
        }
        Ok(())
    }
}

pub struct RolloutStorageBuilder {
    pub config: RolloutStorageConfig,
    pub observation_space: ObservationSpace,
    pub action_space: ActionSpace,
}

impl Default for RolloutStorageBuilder {
    fn default() -> Self {
        RolloutStorageBuilder {
            config: RolloutStorageConfig::default(),
            observation_space: ObservationSpace::default(),
            action_space: ActionSpace::Discrete(4),
        }
    }
}

impl RolloutStorageBuilder {
    pub fn from_config(config: RolloutStorageConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_num_steps(mut self, num_steps: usize) -> Self {
        self.config.num_steps = num_steps;
        self
    }

    pub fn with_num_envs(mut self, num_envs: usize) -> Self {
        self.config.num_envs = num_envs;
        self
    }

    pub fn with_recurrent_hidden_state(mut self, size: usize, num_layers: usize) -> Self {
        self.config.recurrent_hidden_state_size = size;
        self.config.num_recurrent_layers = num_layers;
        self
    }

    pub fn with_double_buffering(mut self, double_buffered: bool) -> Self {
        self.config.double_buffered = double_buffered;
        self
    }

    pub fn with_sensor(mut self, name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> Self {
        self.observation_space = self.observation_space.with_sensor(name, shape, dtype);
        self
    }

    pub fn with_action_space(mut self, action_space: ActionSpace) -> Self {
        self.action_space = action_space;
        self
    }

    pub fn build(&self, device: &Device) -> Result<RolloutStorage> {
        RolloutStorage::new(
            &self.config,
            &self.observation_space,
            &self.action_space,
            device,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() -> anyhow::Result<()> {
        let config: RolloutStorageConfig = serde_json::from_str(
            r#"{ "num_steps": 16, "num_envs": 6, "recurrent_hidden_state_size": 32 }"#,
        )?;
        assert_eq!(config.num_recurrent_layers, 1);
        assert!(!config.double_buffered);
        assert_eq!(config.num_buffers(), 1);
        Ok(())
    }

    #[test]
    fn config_survives_serialization() -> anyhow::Result<()> {
        let config = RolloutStorageConfig {
            double_buffered: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&config)?;
        assert_eq!(serde_json::from_str::<RolloutStorageConfig>(&json)?, config);
        Ok(())
    }

    #[test]
    fn validate_rejects_unsplittable_envs() {
        let config = RolloutStorageConfig {
            num_envs: 5,
            double_buffered: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RolloutError::InvalidConfig(_))
        ));
        let config = RolloutStorageConfig {
            num_steps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(RolloutStorageConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_allocates_storage() -> anyhow::Result<()> {
        let storage = RolloutStorageBuilder::default()
            .with_num_steps(8)
            .with_num_envs(4)
            .with_recurrent_hidden_state(16, 1)
            .with_double_buffering(true)
            .with_sensor("gps", vec![2], DType::F32)
            .with_action_space(ActionSpace::Continuous { size: 2 })
            .build(&Device::Cpu)?;
        assert_eq!(storage.num_steps(), 8);
        assert_eq!(storage.num_buffers(), 2);
        assert_eq!(storage.buffers().leading_dims()?, (9, 4));
        assert_eq!(storage.buffers().leaf("actions")?.dims(), &[9, 4, 2]);
        Ok(())
    }
}
