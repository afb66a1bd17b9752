//! Core types: cell identifiers, column types, table schemas.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Row identifier (cell prefix in the upper 32 bits, serial in the lower 32).
pub type RowId = u64;

/// Name of the flag column marking halo-replicated rows in the primary table.
pub const CACHED_COLUMN: &str = "cached";

/// Name of the catalog metadata sidecar file.
pub const METADATA_FILE: &str = "dbinfo.json";

/// Suffix appended to a tablet path to form its lock file.
pub const LOCK_SUFFIX: &str = ".lock";

/// File extension of tablet files.
pub const TABLET_EXTENSION: &str = "tab";

/// Deepest supported pixelization level (10-bit quantization of pixel centers).
pub const MAX_LEVEL: u32 = 9;

/// A 64-bit cell or row identifier.
///
/// The upper 32 bits are the cell prefix (10-bit x | 10-bit y | 12-bit time
/// slice); the lower 32 bits are the row serial, zero for a pure cell id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub u64);

impl CellId {
    /// Assemble an id from its prefix and serial.
    pub fn from_parts(prefix: u32, serial: u32) -> Self {
        CellId(((prefix as u64) << 32) | serial as u64)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// The upper 32 bits: the cell address.
    pub fn prefix(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The lower 32 bits: the row serial within the cell.
    pub fn serial(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// This id with the serial stripped, i.e. the id of the containing cell.
    pub fn cell(self) -> CellId {
        CellId(self.0 & !0xFFFF_FFFF)
    }

    pub fn time_slice(self) -> u32 {
        self.prefix() & 0xFFF
    }

    /// Whether this cell belongs to the static (first) time slice.
    pub fn is_static(self) -> bool {
        self.time_slice() == 0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for CellId {
    fn from(raw: u64) -> Self {
        CellId(raw)
    }
}

/// Storage class of a column value once loaded into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    UInt,
    Float,
}

/// Fixed-width scalar column type, named with numpy-style type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "b1")]
    Bool,
    #[serde(rename = "i1")]
    I8,
    #[serde(rename = "i2")]
    I16,
    #[serde(rename = "i4")]
    I32,
    #[serde(rename = "i8")]
    I64,
    #[serde(rename = "u1")]
    U8,
    #[serde(rename = "u2")]
    U16,
    #[serde(rename = "u4")]
    U32,
    #[serde(rename = "u8")]
    U64,
    #[serde(rename = "f4")]
    F32,
    #[serde(rename = "f8")]
    F64,
}

impl ColumnType {
    /// Width of one value on disk, in bytes.
    pub fn width(self) -> usize {
        match self {
            ColumnType::Bool | ColumnType::I8 | ColumnType::U8 => 1,
            ColumnType::I16 | ColumnType::U16 => 2,
            ColumnType::I32 | ColumnType::U32 | ColumnType::F32 => 4,
            ColumnType::I64 | ColumnType::U64 | ColumnType::F64 => 8,
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            ColumnType::Bool => ValueKind::Bool,
            ColumnType::I8 | ColumnType::I16 | ColumnType::I32 | ColumnType::I64 => ValueKind::Int,
            ColumnType::U8 | ColumnType::U16 | ColumnType::U32 | ColumnType::U64 => {
                ValueKind::UInt
            }
            ColumnType::F32 | ColumnType::F64 => ValueKind::Float,
        }
    }

    /// The numpy-style type code (`"f8"`, `"u4"`, ...).
    pub fn code(self) -> &'static str {
        match self {
            ColumnType::Bool => "b1",
            ColumnType::I8 => "i1",
            ColumnType::I16 => "i2",
            ColumnType::I32 => "i4",
            ColumnType::I64 => "i8",
            ColumnType::U8 => "u1",
            ColumnType::U16 => "u2",
            ColumnType::U32 => "u4",
            ColumnType::U64 => "u8",
            ColumnType::F32 => "f4",
            ColumnType::F64 => "f8",
        }
    }

    /// Parse a type code. Accepts the numpy byte-order prefixes `<`, `=` and `|`.
    pub fn parse(code: &str) -> Result<Self, SchemaError> {
        let trimmed = code.trim_start_matches(['<', '=', '|']);
        let ty = match trimmed {
            "b1" | "bool" => ColumnType::Bool,
            "i1" => ColumnType::I8,
            "i2" => ColumnType::I16,
            "i4" => ColumnType::I32,
            "i8" => ColumnType::I64,
            "u1" => ColumnType::U8,
            "u2" => ColumnType::U16,
            "u4" => ColumnType::U32,
            "u8" => ColumnType::U64,
            "f4" => ColumnType::F32,
            "f8" => ColumnType::F64,
            _ => return Err(SchemaError::UnknownColumnType(code.to_string())),
        };
        Ok(ty)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Schema definition for one table of a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Ordered `(name, type)` column list.
    pub columns: Vec<(String, ColumnType)>,
    /// Column receiving generated row identifiers. Its presence makes the
    /// table the catalog's primary table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    /// `(ra, dec)` column names used for cell placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_keys: Option<(String, String)>,
    /// Observation time column (MJD) used for time slicing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_key: Option<String>,
}

impl TableSchema {
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        Self {
            columns,
            primary_key: None,
            spatial_keys: None,
            temporal_key: None,
        }
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| *ty)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_type(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Width of one encoded row, in bytes.
    pub fn row_width(&self) -> usize {
        self.columns.iter().map(|(_, ty)| ty.width()).sum()
    }

    pub fn is_primary(&self) -> bool {
        self.primary_key.is_some()
    }
}
