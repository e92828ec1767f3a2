//! A schema-free tree of named tensors that can be indexed, written and moved as one unit.
//!
//! Every leaf of a [`NestedBuffer`] is a candle tensor whose two leading dimensions are shared
//! (time and simulator in the rollout use case). A [`Selector`] applies the same indexing to all
//! leaves at once.

mod error;
mod nested;
mod selector;

pub use error::{BufferError, Result};
pub use nested::{NestedBuffer, Node};
pub use selector::{Index, Selector};

use candle_core::DType as CandleDType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    U32,
    I64,
    BF16,
    F16,
    F32,
    F64,
}

impl DType {
    pub fn to_candle_dtype(&self) -> CandleDType {
        match self {
            DType::U8 => CandleDType::U8,
            DType::U32 => CandleDType::U32,
            DType::I64 => CandleDType::I64,
            DType::BF16 => CandleDType::BF16,
            DType::F16 => CandleDType::F16,
            DType::F32 => CandleDType::F32,
            DType::F64 => CandleDType::F64,
        }
    }

    // candle keeps growing its dtype list, anything we do not model maps to None
    pub fn from_candle_dtype(dtype: CandleDType) -> Option<DType> {
        match dtype {
            CandleDType::U8 => Some(DType::U8),
            CandleDType::U32 => Some(DType::U32),
            CandleDType::I64 => Some(DType::I64),
            CandleDType::BF16 => Some(DType::BF16),
            CandleDType::F16 => Some(DType::F16),
            CandleDType::F32 => Some(DType::F32),
            CandleDType::F64 => Some(DType::F64),
            _ => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::BF16 | DType::F16 | DType::F32 | DType::F64)
    }
}
