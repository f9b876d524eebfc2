use serde::{Deserialize, Serialize};

use crate::{
    api::{Datatype, DatatypeId, ReduceOpId},
    interface::Reducer,
};

/// Little-endian numeric element types understood by [`BasicReducer`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BasicDatatype {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl BasicDatatype {
    const ALL: [BasicDatatype; 5] = [
        BasicDatatype::U8,
        BasicDatatype::I32,
        BasicDatatype::I64,
        BasicDatatype::F32,
        BasicDatatype::F64,
    ];

    pub fn size(&self) -> usize {
        match self {
            BasicDatatype::U8 => 1,
            BasicDatatype::I32 | BasicDatatype::F32 => 4,
            BasicDatatype::I64 | BasicDatatype::F64 => 8,
        }
    }

    pub fn id(&self) -> DatatypeId {
        DatatypeId(*self as u64 + 1)
    }

    pub fn datatype(&self) -> Datatype {
        Datatype::new(self.size(), self.id())
    }

    pub fn from_id(id: DatatypeId) -> Option<Self> {
        Self::ALL.into_iter().find(|dt| dt.id() == id)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BasicOp {
    Sum,
    Prod,
    Min,
    Max,
}

impl BasicOp {
    const ALL: [BasicOp; 4] = [BasicOp::Sum, BasicOp::Prod, BasicOp::Min, BasicOp::Max];

    pub fn id(&self) -> ReduceOpId {
        ReduceOpId(*self as u64 + 1)
    }

    pub fn from_id(id: ReduceOpId) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.id() == id)
    }
}

/// Reducer over [`BasicDatatype`] and [`BasicOp`] handles. Unknown handles
/// leave the destination untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicReducer;

macro_rules! reduce_as {
    ($ty:ty, $op:expr, $src:expr, $dst:expr, $count:expr, $add:path, $mul:path) => {{
        const N: usize = std::mem::size_of::<$ty>();
        for (d, s) in $dst.chunks_exact_mut(N).zip($src.chunks_exact(N)).take($count) {
            let (Ok(a), Ok(b)) = (<[u8; N]>::try_from(&*d), <[u8; N]>::try_from(s))
            else {
                continue;
            };
            let (a, b) = (<$ty>::from_le_bytes(a), <$ty>::from_le_bytes(b));
            let r = match $op {
                BasicOp::Sum => $add(a, b),
                BasicOp::Prod => $mul(a, b),
                BasicOp::Min => {
                    if b < a {
                        b
                    } else {
                        a
                    }
                }
                BasicOp::Max => {
                    if b > a {
                        b
                    } else {
                        a
                    }
                }
            };
            d.copy_from_slice(&r.to_le_bytes());
        }
    }};
}

impl Reducer for BasicReducer {
    fn reduce(
        &self,
        op: ReduceOpId,
        src: &[u8],
        dst: &mut [u8],
        count: usize,
        datatype: DatatypeId,
    ) {
        let (Some(op), Some(dt)) = (BasicOp::from_id(op), BasicDatatype::from_id(datatype))
        else {
            return;
        };
        match dt {
            BasicDatatype::U8 => {
                for (d, s) in dst.iter_mut().zip(src).take(count) {
                    *d = match op {
                        BasicOp::Sum => d.wrapping_add(*s),
                        BasicOp::Prod => d.wrapping_mul(*s),
                        BasicOp::Min => (*d).min(*s),
                        BasicOp::Max => (*d).max(*s),
                    };
                }
            }
            BasicDatatype::I32 => {
                reduce_as!(i32, op, src, dst, count, i32::wrapping_add, i32::wrapping_mul)
            }
            BasicDatatype::I64 => {
                reduce_as!(i64, op, src, dst, count, i64::wrapping_add, i64::wrapping_mul)
            }
            BasicDatatype::F32 => {
                reduce_as!(f32, op, src, dst, count, std::ops::Add::add, std::ops::Mul::mul)
            }
            BasicDatatype::F64 => {
                reduce_as!(f64, op, src, dst, count, std::ops::Add::add, std::ops::Mul::mul)
            }
        }
    }
}

/// Encodes `values` as little-endian `i32` bytes.
pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decodes little-endian `i32` bytes. Trailing bytes are ignored.
pub fn i32_values(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .filter_map(|c| c.try_into().ok().map(i32::from_le_bytes))
        .collect()
}
