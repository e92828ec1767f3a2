use crate::error::{BufferError, Result};
use candle_core::Tensor;
use std::ops::{Range, RangeFull};

/// Indexing along a single dimension.
///
/// `At` removes the indexed dimension from the result of a read, mirroring integer indexing on
/// tensors, and a write through `At` expects a value without that dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Index {
    At(usize),
    Range(Range<usize>),
    Full,
    List(Vec<usize>),
}

impl Index {
    pub(crate) fn drops_dim(&self) -> bool {
        matches!(self, Index::At(_))
    }

    pub(crate) fn validate(&self, dim: usize, size: usize) -> Result<()> {
        let out_of_range = |index| BufferError::OutOfRange { dim, index, size };
        match self {
            Index::At(index) if *index >= size => Err(out_of_range(*index)),
            Index::Range(range) if range.start > range.end => Err(out_of_range(range.start)),
            Index::Range(range) if range.end > size => Err(out_of_range(range.end)),
            Index::List(indices) => match indices.iter().find(|index| **index >= size) {
                Some(index) => Err(out_of_range(*index)),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Number of positions selected along a dimension of the given size.
    pub(crate) fn len(&self, size: usize) -> usize {
        match self {
            Index::At(_) => 1,
            Index::Range(range) => range.len(),
            Index::Full => size,
            Index::List(indices) => indices.len(),
        }
    }

    /// Selects along `dim` without removing it.
    pub(crate) fn select(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        let selected = match self {
            Index::At(index) => tensor.narrow(dim, *index, 1)?,
            Index::Range(range) => tensor.narrow(dim, range.start, range.len())?,
            Index::Full => tensor.clone(),
            Index::List(indices) => {
                let ids = indices.iter().map(|i| *i as u32).collect::<Vec<_>>();
                let ids = Tensor::from_vec(ids, indices.len(), tensor.device())?;
                tensor.index_select(&ids, dim)?
            }
        };
        Ok(selected)
    }

    /// Contiguous write segments as `(offset in the source, destination range)` pairs.
    pub(crate) fn segments(&self, size: usize) -> Vec<(usize, Range<usize>)> {
        match self {
            Index::At(index) => vec![(0, *index..*index + 1)],
            Index::Range(range) => vec![(0, range.clone())],
            Index::Full => vec![(0, 0..size)],
            Index::List(indices) => indices
                .iter()
                .enumerate()
                .map(|(offset, index)| (offset, *index..*index + 1))
                .collect(),
        }
    }
}

impl From<usize> for Index {
    fn from(value: usize) -> Self {
        Index::At(value)
    }
}

impl From<Range<usize>> for Index {
    fn from(value: Range<usize>) -> Self {
        Index::Range(value)
    }
}

impl From<RangeFull> for Index {
    fn from(_: RangeFull) -> Self {
        Index::Full
    }
}

impl From<Vec<usize>> for Index {
    fn from(value: Vec<usize>) -> Self {
        Index::List(value)
    }
}

impl From<&[usize]> for Index {
    fn from(value: &[usize]) -> Self {
        Index::List(value.to_vec())
    }
}

/// A (time, simulator) selection applied identically to every leaf of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub time: Index,
    pub env: Index,
}

impl Selector {
    pub fn new(time: impl Into<Index>, env: impl Into<Index>) -> Self {
        Self {
            time: time.into(),
            env: env.into(),
        }
    }

    /// Selects along time only, every simulator is kept.
    pub fn time(time: impl Into<Index>) -> Self {
        Self::new(time, Index::Full)
    }
}

impl From<usize> for Selector {
    fn from(value: usize) -> Self {
        Selector::time(value)
    }
}

impl From<Range<usize>> for Selector {
    fn from(value: Range<usize>) -> Self {
        Selector::time(value)
    }
}

impl<T: Into<Index>, E: Into<Index>> From<(T, E)> for Selector {
    fn from((time, env): (T, E)) -> Self {
        Selector::new(time, env)
    }
}
