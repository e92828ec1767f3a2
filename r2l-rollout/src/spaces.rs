use r2l_buffer::DType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl SensorSpec {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self { shape, dtype }
    }
}

/// Ordered mapping of sensor names to their shape and dtype. Each sensor becomes one leaf under `observations`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationSpace {
    sensors: Vec<(String, SensorSpec)>,
}

impl ObservationSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sensor, replacing any previous sensor with the same name.
    pub fn with_sensor(mut self, name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> Self {
        let name = name.into();
        let spec = SensorSpec::new(shape, dtype);
        match self.sensors.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = spec,
            None => self.sensors.push((name, spec)),
        }
        self
    }

    pub fn sensors(&self) -> impl Iterator<Item = (&str, &SensorSpec)> {
        self.sensors.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionSpace {
    /// A categorical action over `n` choices, stored as a single integer index.
    Discrete(usize),
    Continuous { size: usize },
}

impl ActionSpace {
    /// Width of the stored action vector.
    pub fn width(&self) -> usize {
        match self {
            Self::Discrete(_) => 1,
            Self::Continuous { size } => *size,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Discrete(_) => DType::I64,
            Self::Continuous { .. } => DType::F32,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Discrete(size) => *size,
            Self::Continuous { size } => *size,
        }
    }
}
