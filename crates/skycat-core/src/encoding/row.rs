//! Fixed-width little-endian row encoding.
//!
//! A row is the concatenation of its column values in schema order, each
//! encoded at the width of its [`ColumnType`]. Rows are stored back to back.

use crate::table::{ColumnData, RowBlock};
use crate::types::{ColumnType, TableSchema};

fn le<const N: usize>(buf: &[u8], off: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[off..off + N]);
    out
}

fn put_value(out: &mut Vec<u8>, col: &ColumnData, ty: ColumnType, i: usize) {
    let v = col.get(i);
    match ty {
        ColumnType::Bool => out.push(u8::from(v.as_bool())),
        ColumnType::I8 => out.extend_from_slice(&(v.as_i64() as i8).to_le_bytes()),
        ColumnType::I16 => out.extend_from_slice(&(v.as_i64() as i16).to_le_bytes()),
        ColumnType::I32 => out.extend_from_slice(&(v.as_i64() as i32).to_le_bytes()),
        ColumnType::I64 => out.extend_from_slice(&v.as_i64().to_le_bytes()),
        ColumnType::U8 => out.push(v.as_u64() as u8),
        ColumnType::U16 => out.extend_from_slice(&(v.as_u64() as u16).to_le_bytes()),
        ColumnType::U32 => out.extend_from_slice(&(v.as_u64() as u32).to_le_bytes()),
        ColumnType::U64 => out.extend_from_slice(&v.as_u64().to_le_bytes()),
        ColumnType::F32 => out.extend_from_slice(&(v.as_f64() as f32).to_le_bytes()),
        ColumnType::F64 => out.extend_from_slice(&v.as_f64().to_le_bytes()),
    }
}

/// Encode a block whose columns already match `schema` (see [`RowBlock::conform`]).
pub fn encode_rows(block: &RowBlock, schema: &TableSchema) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len() * schema.row_width());
    for i in 0..block.len() {
        for (c, (_, ty)) in schema.columns.iter().enumerate() {
            put_value(&mut out, block.column_at(c), *ty, i);
        }
    }
    out
}

/// Decode one column starting at byte `base` of the first row.
fn decode_column(buf: &[u8], ty: ColumnType, base: usize, width: usize, n: usize) -> ColumnData {
    let at = |r: usize| base + r * width;
    match ty {
        ColumnType::Bool => ColumnData::Bool((0..n).map(|r| buf[at(r)] != 0).collect()),
        ColumnType::I8 => {
            ColumnData::Int((0..n).map(|r| i8::from_le_bytes(le(buf, at(r))).into()).collect())
        }
        ColumnType::I16 => {
            ColumnData::Int((0..n).map(|r| i16::from_le_bytes(le(buf, at(r))).into()).collect())
        }
        ColumnType::I32 => {
            ColumnData::Int((0..n).map(|r| i32::from_le_bytes(le(buf, at(r))).into()).collect())
        }
        ColumnType::I64 => {
            ColumnData::Int((0..n).map(|r| i64::from_le_bytes(le(buf, at(r)))).collect())
        }
        ColumnType::U8 => ColumnData::UInt((0..n).map(|r| buf[at(r)].into()).collect()),
        ColumnType::U16 => {
            ColumnData::UInt((0..n).map(|r| u16::from_le_bytes(le(buf, at(r))).into()).collect())
        }
        ColumnType::U32 => {
            ColumnData::UInt((0..n).map(|r| u32::from_le_bytes(le(buf, at(r))).into()).collect())
        }
        ColumnType::U64 => {
            ColumnData::UInt((0..n).map(|r| u64::from_le_bytes(le(buf, at(r)))).collect())
        }
        ColumnType::F32 => {
            ColumnData::Float((0..n).map(|r| f32::from_le_bytes(le(buf, at(r))).into()).collect())
        }
        ColumnType::F64 => {
            ColumnData::Float((0..n).map(|r| f64::from_le_bytes(le(buf, at(r)))).collect())
        }
    }
}

/// Decode `n` rows laid out per `schema` from `buf`.
///
/// `buf` must hold at least `n * schema.row_width()` bytes.
pub fn decode_rows(buf: &[u8], schema: &TableSchema, n: usize) -> RowBlock {
    let width = schema.row_width();
    let mut block = RowBlock::new();
    let mut base = 0;
    for (name, ty) in &schema.columns {
        let col = decode_column(buf, *ty, base, width, n);
        // Every decoded column holds exactly n values.
        let _ = block.push_column(name.clone(), *ty, col);
        base += ty.width();
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Value;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ("id".to_string(), ColumnType::U64),
            ("flag".to_string(), ColumnType::Bool),
            ("n".to_string(), ColumnType::I16),
            ("mag".to_string(), ColumnType::F32),
        ])
    }

    #[test]
    fn test_row_width_layout() {
        let block = RowBlock::new()
            .with_column("id", ColumnType::U64, vec![0x0102u64])
            .unwrap()
            .with_column("flag", ColumnType::Bool, vec![true])
            .unwrap()
            .with_column("n", ColumnType::I16, vec![-2i64])
            .unwrap()
            .with_column("mag", ColumnType::F32, vec![1.5])
            .unwrap();
        let bytes = encode_rows(&block, &schema());
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[0..2], &[0x02, 0x01]);
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..11], &(-2i16).to_le_bytes());

        let back = decode_rows(&bytes, &schema(), 1);
        assert_eq!(back.row(0).get("n"), Some(Value::Int(-2)));
        assert_eq!(back.row(0).get("mag"), Some(Value::Float(1.5)));
    }

    #[test]
    fn test_decode_empty() {
        let block = decode_rows(&[], &schema(), 0);
        assert!(block.is_empty());
        assert_eq!(block.num_columns(), 4);
    }
}
