use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::encoding::row::{decode_rows, encode_rows};
use crate::error::StorageError;
use crate::table::RowBlock;
use crate::types::TableSchema;

use super::header::{HEADER_SIZE, TabletHeader};

/// One table's rows for one cell: a header, the JSON schema, then
/// fixed-width row records.
///
/// Readers only trust the committed row count in the header, so records
/// written past it by an in-flight append are invisible until the header
/// is rewritten.
#[derive(Debug)]
pub struct Tablet {
    path: PathBuf,
    file: File,
    header: TabletHeader,
    schema: TableSchema,
}

fn write_new(
    path: &Path,
    schema: &TableSchema,
    rows: &[u8],
    header: TabletHeader,
) -> Result<File, StorageError> {
    let schema_json = serde_json::to_vec(schema).map_err(|e| StorageError::CorruptedTablet {
        path: path.to_path_buf(),
        reason: format!("schema serialization failed: {e}"),
    })?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    let header = TabletHeader {
        schema_len: schema_json.len() as u32,
        ..header
    };
    file.write_all_at(&header.to_bytes(), 0)?;
    file.write_all_at(&schema_json, HEADER_SIZE as u64)?;
    file.write_all_at(rows, header.data_offset())?;
    file.sync_all()?;
    Ok(file)
}

impl Tablet {
    /// Create a new, empty tablet at `path`. Fails if the file exists.
    pub fn create(path: &Path, schema: &TableSchema) -> Result<Self, StorageError> {
        let header = TabletHeader::new(schema.row_width(), 0, schema.is_primary());
        let file = write_new(path, schema, &[], header)?;
        Self::from_file(path, file)
    }

    /// Open an existing tablet.
    pub fn open(path: &Path, writable: bool) -> Result<Self, StorageError> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Self::from_file(path, file)
    }

    /// Open a tablet for reading, returning `None` if it does not exist.
    pub fn open_if_exists(path: &Path) -> Result<Option<Self>, StorageError> {
        match Self::open(path, false) {
            Ok(t) => Ok(Some(t)),
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn from_file(path: &Path, file: File) -> Result<Self, StorageError> {
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        let header = TabletHeader::from_bytes(&buf, path)?;

        let mut schema_buf = vec![0u8; header.schema_len as usize];
        file.read_exact_at(&mut schema_buf, HEADER_SIZE as u64)?;
        let schema: TableSchema =
            serde_json::from_slice(&schema_buf).map_err(|e| StorageError::CorruptedTablet {
                path: path.to_path_buf(),
                reason: format!("bad schema: {e}"),
            })?;
        if schema.row_width() != header.row_width as usize {
            return Err(StorageError::CorruptedTablet {
                path: path.to_path_buf(),
                reason: format!(
                    "row width {} does not match schema width {}",
                    header.row_width,
                    schema.row_width()
                ),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            schema,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &TabletHeader {
        &self.header
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn row_count(&self) -> u64 {
        self.header.row_count
    }

    /// Next serial the counter will hand out.
    pub fn next_serial(&self) -> u64 {
        self.header.next_serial
    }

    /// Read every committed row.
    pub fn read_all(&self) -> Result<RowBlock, StorageError> {
        let n = self.header.row_count as usize;
        let mut buf = vec![0u8; n * self.header.row_width as usize];
        self.file
            .read_exact_at(&mut buf, self.header.data_offset())
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => StorageError::CorruptedTablet {
                    path: self.path.clone(),
                    reason: format!("file shorter than {n} committed rows"),
                },
                _ => StorageError::Io(e),
            })?;
        Ok(decode_rows(&buf, &self.schema, n))
    }

    /// Append rows conforming to this tablet's schema, then commit the new
    /// row count and serial counter.
    pub fn append(&mut self, rows: &RowBlock, next_serial: u64) -> Result<(), StorageError> {
        let bytes = encode_rows(rows, &self.schema);
        self.file.write_all_at(&bytes, self.header.data_end())?;
        self.file.sync_data()?;

        let header = TabletHeader {
            row_count: self.header.row_count + rows.len() as u64,
            next_serial: next_serial.max(self.header.next_serial),
            ..self.header
        };
        self.file.write_all_at(&header.to_bytes(), 0)?;
        self.file.sync_data()?;
        self.header = header;
        Ok(())
    }

    /// Replace the tablet's contents with `rows`, keeping its serial counter.
    ///
    /// The new contents are written to a sibling file and renamed over the
    /// original, so readers holding the old file keep a consistent view.
    pub fn rewrite(&mut self, rows: &RowBlock) -> Result<(), StorageError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }

        let header = TabletHeader {
            row_count: rows.len() as u64,
            ..self.header
        };
        let bytes = encode_rows(rows, &self.schema);
        let file = write_new(&tmp, &self.schema, &bytes, header)?;
        fs::rename(&tmp, &self.path)?;
        *self = Self::from_file(&self.path, file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{ColumnData, Value};
    use crate::types::ColumnType;
    use tempfile::tempdir;

    fn schema() -> TableSchema {
        let mut s = TableSchema::new(vec![
            ("id".to_string(), ColumnType::U64),
            ("ra".to_string(), ColumnType::F64),
        ]);
        s.primary_key = Some("id".to_string());
        s
    }

    fn rows(ids: Vec<u64>, ra: Vec<f64>) -> RowBlock {
        RowBlock::new()
            .with_column("id", ColumnType::U64, ids)
            .unwrap()
            .with_column("ra", ColumnType::F64, ra)
            .unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00.catalog.static.tab");
        {
            let t = Tablet::create(&path, &schema()).unwrap();
            assert_eq!(t.row_count(), 0);
            assert_eq!(t.next_serial(), 1);
        }
        let t = Tablet::open(&path, false).unwrap();
        assert_eq!(t.schema(), &schema());
        assert!(t.header().is_primary());
        assert!(t.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_append_commits_rows_and_counter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tab");
        let mut t = Tablet::create(&path, &schema()).unwrap();
        t.append(&rows(vec![1, 2], vec![10.0, 11.0]), 3).unwrap();
        t.append(&rows(vec![3], vec![12.0]), 4).unwrap();
        drop(t);

        let t = Tablet::open(&path, false).unwrap();
        assert_eq!(t.row_count(), 3);
        assert_eq!(t.next_serial(), 4);
        let block = t.read_all().unwrap();
        assert_eq!(block.column("id"), Some(&ColumnData::UInt(vec![1, 2, 3])));
    }

    #[test]
    fn test_uncommitted_bytes_are_invisible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tab");
        let mut t = Tablet::create(&path, &schema()).unwrap();
        t.append(&rows(vec![1], vec![10.0]), 2).unwrap();

        // Simulate a writer that wrote records but has not committed the header.
        let raw = OpenOptions::new().write(true).open(&path).unwrap();
        raw.write_all_at(&[0xAB; 32], t.header().data_end()).unwrap();

        let reader = Tablet::open(&path, false).unwrap();
        assert_eq!(reader.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_rewrite_keeps_counter_and_old_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tab");
        let mut t = Tablet::create(&path, &schema()).unwrap();
        t.append(&rows(vec![1, 2], vec![10.0, 11.0]), 3).unwrap();

        let old_reader = Tablet::open(&path, false).unwrap();
        t.rewrite(&rows(vec![2], vec![11.0])).unwrap();
        assert_eq!(t.next_serial(), 3);
        assert_eq!(t.read_all().unwrap().len(), 1);
        assert_eq!(old_reader.read_all().unwrap().len(), 2);

        let fresh = Tablet::open(&path, false).unwrap();
        assert_eq!(fresh.read_all().unwrap().row(0).get("ra"), Some(Value::Float(11.0)));
    }

    #[test]
    fn test_missing_tablet_is_none() {
        let dir = tempdir().unwrap();
        assert!(Tablet::open_if_exists(&dir.path().join("nope.tab")).unwrap().is_none());
    }
}
