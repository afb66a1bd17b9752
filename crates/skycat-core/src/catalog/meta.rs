//! The `dbinfo.json` catalog metadata sidecar.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::encoding::Partitioning;
use crate::error::MetadataError;
use crate::types::{ColumnType, METADATA_FILE, TableSchema};

/// A registered cross-matched catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XmatchEntry {
    /// Root directory of the foreign catalog.
    pub path: PathBuf,
    /// Link table (`id1`, `id2`) in this catalog.
    pub table: String,
}

/// In-memory form of the metadata sidecar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogMeta {
    pub name: String,
    pub level: u32,
    pub t0: f64,
    pub dt: f64,
    pub nrows: u64,
    pub primary_table: Option<String>,
    pub tables: BTreeMap<String, TableSchema>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub xmatch: BTreeMap<String, XmatchEntry>,
}

/// On-disk form, accepting both the current layout and the older flat one
/// with a single top-level `columns` list.
#[derive(Deserialize)]
struct RawMeta {
    name: String,
    level: u32,
    t0: f64,
    dt: f64,
    #[serde(default)]
    nrows: u64,
    #[serde(default)]
    primary_table: Option<String>,
    #[serde(default)]
    tables: BTreeMap<String, TableSchema>,
    #[serde(default)]
    columns: Option<Vec<(String, ColumnType)>>,
    #[serde(default)]
    xmatch: BTreeMap<String, XmatchEntry>,
}

impl From<RawMeta> for CatalogMeta {
    fn from(raw: RawMeta) -> Self {
        let mut tables = raw.tables;
        let mut primary_table = raw.primary_table;
        if let Some(columns) = raw.columns {
            let mut schema = TableSchema::new(columns);
            schema.primary_key = Some("id".to_string());
            schema.spatial_keys = Some(("ra".to_string(), "dec".to_string()));
            tables = BTreeMap::from([("catalog".to_string(), schema)]);
            primary_table = Some("catalog".to_string());
        }
        Self {
            name: raw.name,
            level: raw.level,
            t0: raw.t0,
            dt: raw.dt,
            nrows: raw.nrows,
            primary_table,
            tables,
            xmatch: raw.xmatch,
        }
    }
}

impl CatalogMeta {
    pub fn new(name: impl Into<String>, partitioning: Partitioning) -> Self {
        Self {
            name: name.into(),
            level: partitioning.level,
            t0: partitioning.t0,
            dt: partitioning.dt,
            nrows: 0,
            primary_table: None,
            tables: BTreeMap::new(),
            xmatch: BTreeMap::new(),
        }
    }

    pub fn partitioning(&self) -> Partitioning {
        Partitioning {
            level: self.level,
            t0: self.t0,
            dt: self.dt,
        }
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(METADATA_FILE)
    }

    /// Load the sidecar from a catalog root.
    pub fn load(root: &Path) -> Result<Self, MetadataError> {
        let path = Self::path(root);
        let data = fs::read(&path).map_err(|source| MetadataError::Io {
            path: path.clone(),
            source,
        })?;
        let raw: RawMeta = serde_json::from_slice(&data)?;
        Ok(raw.into())
    }

    /// Serialize to pretty-printed JSON with sorted keys.
    pub fn to_json(&self) -> Result<String, MetadataError> {
        // serde_json's map is ordered, so going through `Value` sorts every key.
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Write the sidecar, replacing any existing one atomically.
    pub fn store(&self, root: &Path) -> Result<(), MetadataError> {
        let path = Self::path(root);
        let tmp = root.join(format!("{METADATA_FILE}.tmp"));
        let io_err = |source| MetadataError::Io {
            path: path.clone(),
            source,
        };
        fs::write(&tmp, self.to_json()?).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }

    pub fn primary_schema(&self) -> Option<&TableSchema> {
        self.primary_table.as_ref().and_then(|t| self.tables.get(t))
    }

    /// Whether `table` is a cross-match link table rather than per-object data.
    pub fn is_link_table(&self, table: &str) -> bool {
        self.xmatch.values().any(|x| x.table == table)
    }

    /// Tables holding per-object rows aligned with the primary table,
    /// primary table first, then the rest in name order.
    pub fn aligned_tables(&self) -> Vec<String> {
        let mut out: Vec<String> = self.primary_table.iter().cloned().collect();
        out.extend(
            self.tables
                .keys()
                .filter(|t| Some(*t) != self.primary_table.as_ref() && !self.is_link_table(t))
                .cloned(),
        );
        out
    }
}
