use std::sync::Arc;

use crate::error::{QueryError, SchemaError};
use crate::types::{ColumnType, TableSchema};

use super::value::{ColumnData, Value};

/// A columnar batch of rows with a named, typed schema.
///
/// Every column holds exactly [`len`](RowBlock::len) values. Column order is
/// significant: it is the order rows are projected and written in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowBlock {
    fields: Vec<(String, ColumnType)>,
    columns: Vec<ColumnData>,
    len: usize,
}

impl RowBlock {
    /// An empty block with no columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty block carrying the given schema.
    pub fn empty(fields: &[(String, ColumnType)]) -> Self {
        Self {
            fields: fields.to_vec(),
            columns: fields
                .iter()
                .map(|(_, ty)| ColumnData::with_capacity(*ty, 0))
                .collect(),
            len: 0,
        }
    }

    /// A block of `n` all-zero rows carrying the given schema.
    pub fn zeroed(fields: &[(String, ColumnType)], n: usize) -> Self {
        Self {
            fields: fields.to_vec(),
            columns: fields.iter().map(|(_, ty)| ColumnData::zeros(*ty, n)).collect(),
            len: n,
        }
    }

    /// Builder-style column insertion; see [`push_column`](Self::push_column).
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        ty: ColumnType,
        data: impl Into<ColumnData>,
    ) -> Result<Self, QueryError> {
        self.push_column(name, ty, data)?;
        Ok(self)
    }

    /// Add (or replace) a column, casting its values to `ty`.
    pub fn push_column(
        &mut self,
        name: impl Into<String>,
        ty: ColumnType,
        data: impl Into<ColumnData>,
    ) -> Result<(), QueryError> {
        let name = name.into();
        let data = data.into();
        if self.fields.is_empty() {
            self.len = data.len();
        } else {
            data.check_len(self.len)?;
        }
        let data = if data.kind() == ty.kind() && ty.width() == 8 {
            data
        } else {
            data.cast(ty)
        };
        match self.index_of(&name) {
            Some(i) => {
                self.fields[i].1 = ty;
                self.columns[i] = data;
            }
            None => {
                self.fields.push((name, ty));
                self.columns.push(data);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_columns(&self) -> usize {
        self.fields.len()
    }

    /// The `(name, type)` schema of this block.
    pub fn fields(&self) -> &[(String, ColumnType)] {
        &self.fields
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.index_of(name).map(|i| &self.columns[i])
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.index_of(name).map(|i| self.fields[i].1)
    }

    pub fn column_at(&self, i: usize) -> &ColumnData {
        &self.columns[i]
    }

    /// Gather rows by index (indices may repeat).
    pub fn take(&self, idx: &[usize]) -> RowBlock {
        RowBlock {
            fields: self.fields.clone(),
            columns: self.columns.iter().map(|c| c.take(idx)).collect(),
            len: idx.len(),
        }
    }

    /// Keep the rows whose mask entry is set.
    pub fn filter(&self, mask: &[bool]) -> RowBlock {
        let columns: Vec<ColumnData> = self.columns.iter().map(|c| c.filter(mask)).collect();
        let len = mask.iter().take(self.len).filter(|&&m| m).count();
        RowBlock {
            fields: self.fields.clone(),
            columns,
            len,
        }
    }

    /// Append the rows of `other`, matching columns by name.
    ///
    /// Appending to a block without columns adopts `other`'s schema.
    pub fn append(&mut self, other: &RowBlock) -> Result<(), QueryError> {
        if self.fields.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        for (i, (name, _)) in self.fields.iter().enumerate() {
            let src = other
                .column(name)
                .ok_or_else(|| QueryError::UnknownColumn(name.clone()))?;
            self.columns[i].extend_from(src);
        }
        self.len += other.len;
        Ok(())
    }

    /// Concatenate blocks sharing a schema.
    pub fn concat<'a>(blocks: impl IntoIterator<Item = &'a RowBlock>) -> Result<RowBlock, QueryError> {
        let mut out = RowBlock::new();
        for b in blocks {
            out.append(b)?;
        }
        Ok(out)
    }

    /// Reshape this block to exactly the columns of `schema`, in schema order.
    ///
    /// Columns named in `zero_fill` may be absent and are then filled with
    /// zeros; any other absent column is an error. Values are cast to the
    /// declared column types.
    pub fn conform(&self, schema: &TableSchema, zero_fill: &[&str]) -> Result<RowBlock, SchemaError> {
        let mut columns = Vec::with_capacity(schema.columns.len());
        for (name, ty) in &schema.columns {
            let data = match self.column(name) {
                Some(col) => col.cast(*ty),
                None if zero_fill.contains(&name.as_str()) => ColumnData::zeros(*ty, self.len),
                None => return Err(SchemaError::MissingColumn(name.clone())),
            };
            columns.push(data);
        }
        Ok(RowBlock {
            fields: schema.columns.clone(),
            columns,
            len: self.len,
        })
    }

    /// Keep only the named columns, in the given order.
    pub fn select(&self, names: &[&str]) -> Result<RowBlock, QueryError> {
        let mut out = RowBlock {
            len: self.len,
            ..RowBlock::default()
        };
        for name in names {
            let i = self
                .index_of(name)
                .ok_or_else(|| QueryError::UnknownColumn(name.to_string()))?;
            out.fields.push(self.fields[i].clone());
            out.columns.push(self.columns[i].clone());
        }
        Ok(out)
    }

    pub fn row(&self, i: usize) -> Row {
        let names: Arc<[String]> = self.fields.iter().map(|(n, _)| n.clone()).collect();
        self.row_with(names, i)
    }

    fn row_with(&self, names: Arc<[String]>, i: usize) -> Row {
        Row {
            names,
            values: self.columns.iter().map(|c| c.get(i)).collect(),
        }
    }

    /// All rows, in order.
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        let names: Arc<[String]> = self.fields.iter().map(|(n, _)| n.clone()).collect();
        (0..self.len).map(move |i| self.row_with(Arc::clone(&names), i))
    }

    /// Consume the block, yielding its rows.
    pub fn into_rows(self) -> std::vec::IntoIter<Row> {
        self.rows().collect::<Vec<_>>().into_iter()
    }
}

/// One row of a [`RowBlock`].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    names: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RowBlock {
        RowBlock::new()
            .with_column("ra", ColumnType::F64, vec![1.0, 2.0, 3.0])
            .unwrap()
            .with_column("mag", ColumnType::F32, vec![20.5, 21.0, 19.25])
            .unwrap()
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = sample().with_column("dec", ColumnType::F64, vec![0.0]);
        assert!(matches!(
            err,
            Err(QueryError::LengthMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_conform_fills_and_orders() {
        let mut schema = TableSchema::new(vec![
            ("id".to_string(), ColumnType::U64),
            ("mag".to_string(), ColumnType::F32),
            ("ra".to_string(), ColumnType::F64),
        ]);
        schema.primary_key = Some("id".to_string());
        let out = sample().conform(&schema, &["id"]).unwrap();
        assert_eq!(out.names().collect::<Vec<_>>(), vec!["id", "mag", "ra"]);
        assert_eq!(out.column("id"), Some(&ColumnData::UInt(vec![0, 0, 0])));

        let err = RowBlock::new()
            .with_column("ra", ColumnType::F64, vec![1.0])
            .unwrap()
            .conform(&schema, &["id"]);
        assert!(matches!(err, Err(SchemaError::MissingColumn(c)) if c == "mag"));
    }

    #[test]
    fn test_append_and_rows() {
        let mut a = sample();
        a.append(&sample().filter(&[false, true, false])).unwrap();
        assert_eq!(a.len(), 4);
        let last = a.rows().last().unwrap();
        assert_eq!(last.get("ra"), Some(Value::Float(2.0)));
        assert_eq!(last.get("nope"), None);
    }

    #[test]
    fn test_take_repeats_rows() {
        let b = sample().take(&[2, 2, 0]);
        assert_eq!(b.len(), 3);
        assert_eq!(b.column("ra"), Some(&ColumnData::Float(vec![3.0, 3.0, 1.0])));
    }
}
