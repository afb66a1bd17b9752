//! Error types for all skycat operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::CellId;

/// Top-level error type for skycat operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Job(#[from] JobError),

    /// Raised by user-supplied mapper, reducer, or filter callbacks.
    #[error("callback failed: {0}")]
    Callback(String),
}

impl Error {
    /// Convenience constructor for callback failures.
    pub fn callback(msg: impl Into<String>) -> Self {
        Error::Callback(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid magic bytes in tablet {0}")]
    InvalidMagic(PathBuf),

    #[error("unsupported tablet version: {0}")]
    UnsupportedVersion(u32),

    #[error("corrupted tablet {path}: {reason}")]
    CorruptedTablet { path: PathBuf, reason: String },

    #[error("cell lock {0} is held by another writer")]
    Locked(PathBuf),

    #[error("gave up acquiring cell locks after {attempts} attempts ({pending} cells still locked)")]
    LockContention { attempts: u32, pending: usize },

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("primary table already exists: {0}")]
    PrimaryTableExists(String),

    #[error("primary table '{0}' has no spatial keys")]
    MissingSpatialKeys(String),

    #[error("catalog has no primary table")]
    NoPrimaryTable,

    #[error("column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error("rows are missing column '{0}'")]
    MissingColumn(String),

    #[error("unknown catalog: {0}")]
    UnknownCatalog(String),

    #[error("select list must reference at least one column of the primary catalog")]
    NoPrimaryReference,

    #[error("invalid pixelization level {0} (expected 1..=9)")]
    InvalidLevel(u32),

    #[error("catalog '{0}' is partitioned differently and cannot be joined")]
    PartitioningMismatch(String),

    #[error("unknown column type: {0}")]
    UnknownColumnType(String),

    #[error("a non-primary table needs an explicit target cell")]
    CellTargetRequired,

    #[error("expected {expected} target cells, got {actual}")]
    CellTargetLength { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to access catalog metadata {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("malformed catalog metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("a catalog already exists at {0}")]
    AlreadyExists(PathBuf),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("column '{0}' not found in any catalog")]
    UnknownColumn(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("column length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("partition {cell_id} failed: {message}")]
    Partition { cell_id: CellId, message: String },

    #[error("reducer failed: {0}")]
    Reduce(String),
}

pub type Result<T> = std::result::Result<T, Error>;
