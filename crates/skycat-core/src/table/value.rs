//! Scalar values and typed column buffers.

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::types::{ColumnType, ValueKind};

/// A single scalar cell value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Bool(b) => f64::from(u8::from(b)),
            Value::Int(v) => v as f64,
            Value::UInt(v) => v as f64,
            Value::Float(v) => v,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Value::Bool(b) => i64::from(b),
            Value::Int(v) => v,
            Value::UInt(v) => v as i64,
            Value::Float(v) => v as i64,
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            Value::Bool(b) => u64::from(b),
            Value::Int(v) => v as u64,
            Value::UInt(v) => v,
            Value::Float(v) => v as u64,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Value::Bool(b) => b,
            Value::Int(v) => v != 0,
            Value::UInt(v) => v != 0,
            Value::Float(v) => v != 0.0,
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::UInt(_) => ValueKind::UInt,
            Value::Float(_) => ValueKind::Float,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// Truncate an integer to the range of a narrower signed type.
fn narrow_int(v: i64, ty: ColumnType) -> i64 {
    match ty {
        ColumnType::I8 => v as i8 as i64,
        ColumnType::I16 => v as i16 as i64,
        ColumnType::I32 => v as i32 as i64,
        _ => v,
    }
}

fn narrow_uint(v: u64, ty: ColumnType) -> u64 {
    match ty {
        ColumnType::U8 => v as u8 as u64,
        ColumnType::U16 => v as u16 as u64,
        ColumnType::U32 => v as u32 as u64,
        _ => v,
    }
}

/// In-memory column buffer. Narrow integer and float types are widened to
/// 64 bits; the declared [`ColumnType`] travels alongside in [`RowBlock`](super::RowBlock).
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float(Vec<f64>),
}

impl ColumnData {
    /// A column of `n` zero values (the catalog NULL) of type `ty`.
    pub fn zeros(ty: ColumnType, n: usize) -> Self {
        match ty.kind() {
            ValueKind::Bool => ColumnData::Bool(vec![false; n]),
            ValueKind::Int => ColumnData::Int(vec![0; n]),
            ValueKind::UInt => ColumnData::UInt(vec![0; n]),
            ValueKind::Float => ColumnData::Float(vec![0.0; n]),
        }
    }

    /// A column repeating `value` `n` times.
    pub fn broadcast(value: Value, n: usize) -> Self {
        match value {
            Value::Bool(v) => ColumnData::Bool(vec![v; n]),
            Value::Int(v) => ColumnData::Int(vec![v; n]),
            Value::UInt(v) => ColumnData::UInt(vec![v; n]),
            Value::Float(v) => ColumnData::Float(vec![v; n]),
        }
    }

    pub fn with_capacity(ty: ColumnType, n: usize) -> Self {
        match ty.kind() {
            ValueKind::Bool => ColumnData::Bool(Vec::with_capacity(n)),
            ValueKind::Int => ColumnData::Int(Vec::with_capacity(n)),
            ValueKind::UInt => ColumnData::UInt(Vec::with_capacity(n)),
            ValueKind::Float => ColumnData::Float(Vec::with_capacity(n)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::UInt(v) => v.len(),
            ColumnData::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ColumnData::Bool(_) => ValueKind::Bool,
            ColumnData::Int(_) => ValueKind::Int,
            ColumnData::UInt(_) => ValueKind::UInt,
            ColumnData::Float(_) => ValueKind::Float,
        }
    }

    pub fn get(&self, i: usize) -> Value {
        match self {
            ColumnData::Bool(v) => Value::Bool(v[i]),
            ColumnData::Int(v) => Value::Int(v[i]),
            ColumnData::UInt(v) => Value::UInt(v[i]),
            ColumnData::Float(v) => Value::Float(v[i]),
        }
    }

    /// Append a value, converting it to this column's storage class.
    pub fn push(&mut self, value: Value) {
        match self {
            ColumnData::Bool(v) => v.push(value.as_bool()),
            ColumnData::Int(v) => v.push(value.as_i64()),
            ColumnData::UInt(v) => v.push(value.as_u64()),
            ColumnData::Float(v) => v.push(value.as_f64()),
        }
    }

    /// Gather rows by index.
    pub fn take(&self, idx: &[usize]) -> Self {
        match self {
            ColumnData::Bool(v) => ColumnData::Bool(idx.iter().map(|&i| v[i]).collect()),
            ColumnData::Int(v) => ColumnData::Int(idx.iter().map(|&i| v[i]).collect()),
            ColumnData::UInt(v) => ColumnData::UInt(idx.iter().map(|&i| v[i]).collect()),
            ColumnData::Float(v) => ColumnData::Float(idx.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Keep rows whose mask entry is set.
    pub fn filter(&self, mask: &[bool]) -> Self {
        fn keep<T: Copy>(v: &[T], mask: &[bool]) -> Vec<T> {
            v.iter()
                .zip(mask)
                .filter_map(|(x, &m)| m.then_some(*x))
                .collect()
        }
        match self {
            ColumnData::Bool(v) => ColumnData::Bool(keep(v, mask)),
            ColumnData::Int(v) => ColumnData::Int(keep(v, mask)),
            ColumnData::UInt(v) => ColumnData::UInt(keep(v, mask)),
            ColumnData::Float(v) => ColumnData::Float(keep(v, mask)),
        }
    }

    /// Append another column, converting its values to this storage class.
    pub fn extend_from(&mut self, other: &ColumnData) {
        match (self, other) {
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a.extend_from_slice(b),
            (ColumnData::Int(a), ColumnData::Int(b)) => a.extend_from_slice(b),
            (ColumnData::UInt(a), ColumnData::UInt(b)) => a.extend_from_slice(b),
            (ColumnData::Float(a), ColumnData::Float(b)) => a.extend_from_slice(b),
            (this, other) => {
                for i in 0..other.len() {
                    this.push(other.get(i));
                }
            }
        }
    }

    /// Convert to the storage class of `ty`, truncating values to its width.
    pub fn cast(&self, ty: ColumnType) -> Self {
        let n = self.len();
        match ty.kind() {
            ValueKind::Bool => ColumnData::Bool(self.to_bool_vec()),
            ValueKind::Int => {
                ColumnData::Int((0..n).map(|i| narrow_int(self.get(i).as_i64(), ty)).collect())
            }
            ValueKind::UInt => {
                ColumnData::UInt((0..n).map(|i| narrow_uint(self.get(i).as_u64(), ty)).collect())
            }
            ValueKind::Float => {
                let v = self.to_f64_vec();
                if ty == ColumnType::F32 {
                    ColumnData::Float(v.into_iter().map(|x| x as f32 as f64).collect())
                } else {
                    ColumnData::Float(v)
                }
            }
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            ColumnData::Float(v) => v.clone(),
            ColumnData::Int(v) => v.iter().map(|&x| x as f64).collect(),
            ColumnData::UInt(v) => v.iter().map(|&x| x as f64).collect(),
            ColumnData::Bool(v) => v.iter().map(|&x| f64::from(u8::from(x))).collect(),
        }
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        (0..self.len()).map(|i| self.get(i).as_i64()).collect()
    }

    pub fn to_bool_vec(&self) -> Vec<bool> {
        match self {
            ColumnData::Bool(v) => v.clone(),
            _ => (0..self.len()).map(|i| self.get(i).as_bool()).collect(),
        }
    }

    pub fn as_u64(&self) -> Option<&[u64]> {
        match self {
            ColumnData::UInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            ColumnData::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            ColumnData::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Identifier-style view: every value converted to `u64`.
    pub fn to_u64_vec(&self) -> Vec<u64> {
        match self {
            ColumnData::UInt(v) => v.clone(),
            _ => (0..self.len()).map(|i| self.get(i).as_u64()).collect(),
        }
    }

    pub(crate) fn check_len(&self, expected: usize) -> Result<(), QueryError> {
        if self.len() != expected {
            return Err(QueryError::LengthMismatch {
                expected,
                actual: self.len(),
            });
        }
        Ok(())
    }
}

impl From<Vec<bool>> for ColumnData {
    fn from(v: Vec<bool>) -> Self {
        ColumnData::Bool(v)
    }
}

impl From<Vec<i64>> for ColumnData {
    fn from(v: Vec<i64>) -> Self {
        ColumnData::Int(v)
    }
}

impl From<Vec<u64>> for ColumnData {
    fn from(v: Vec<u64>) -> Self {
        ColumnData::UInt(v)
    }
}

impl From<Vec<f64>> for ColumnData {
    fn from(v: Vec<f64>) -> Self {
        ColumnData::Float(v)
    }
}
