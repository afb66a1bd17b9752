use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogMeta, Partition, XmatchEntry, resolve};
use crate::config::EngineConfig;
use crate::encoding::{MAX_SLICE, Partitioning};
use crate::error::{Error, MetadataError, QueryError, SchemaError, StorageError};
use crate::geometry::{Footprint, Polygon, sky};
use crate::mapreduce::halo::{self, DEFAULT_MARGIN_ARCSEC, HaloMargin};
use crate::mapreduce::{Contribution, HaloStats};
use crate::query::Query;
use crate::storage::CellStore;
use crate::table::RowBlock;
use crate::types::{CACHED_COLUMN, CellId, ColumnType, RowId, TableSchema};

use super::builders::{JobBuilder, TableBuilder};

/// Where rows of an append land.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CellTarget {
    /// Computed from each row's spatial (and temporal) keys. Primary table only.
    #[default]
    Derived,
    /// Every row goes to one cell.
    All(CellId),
    /// One cell per row.
    PerRow(Vec<CellId>),
}

struct CatalogInner {
    root: PathBuf,
    config: EngineConfig,
    meta: RwLock<CatalogMeta>,
    store: CellStore,
    /// Cross-matched catalogs opened so far, by name.
    xmatched: Mutex<HashMap<String, Catalog>>,
}

/// Handle to an on-disk catalog.
///
/// `Catalog` is cheaply clonable (`Arc`-based) and `Send + Sync`; every clone
/// shares the same metadata and configuration.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<CatalogInner>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("name", &self.name())
            .field("path", &self.inner.root)
            .finish()
    }
}

impl Catalog {
    /// Create a new, empty catalog rooted at `path`.
    pub fn create(
        path: impl AsRef<Path>,
        name: &str,
        partitioning: Partitioning,
    ) -> Result<Self, Error> {
        Self::create_with_config(path, name, partitioning, EngineConfig::default())
    }

    pub fn create_with_config(
        path: impl AsRef<Path>,
        name: &str,
        partitioning: Partitioning,
        config: EngineConfig,
    ) -> Result<Self, Error> {
        partitioning.validate()?;
        let root = path.as_ref().to_path_buf();
        if CatalogMeta::path(&root).exists() {
            return Err(MetadataError::AlreadyExists(root).into());
        }
        fs::create_dir_all(&root).map_err(StorageError::from)?;
        let meta = CatalogMeta::new(name, partitioning);
        meta.store(&root)?;
        info!(
            catalog = name,
            path = %root.display(),
            level = partitioning.level,
            t0 = partitioning.t0,
            dt = partitioning.dt,
            "created catalog"
        );
        Ok(Self::from_parts(root, meta, config))
    }

    /// Open an existing catalog.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, Error> {
        let root = path.as_ref().to_path_buf();
        let meta = CatalogMeta::load(&root)?;
        meta.partitioning().validate()?;
        debug!(catalog = %meta.name, path = %root.display(), "opened catalog");
        Ok(Self::from_parts(root, meta, config))
    }

    fn from_parts(root: PathBuf, meta: CatalogMeta, config: EngineConfig) -> Self {
        let store = CellStore::new(root.clone(), meta.partitioning(), config.lock.clone());
        Self {
            inner: Arc::new(CatalogInner {
                root,
                config,
                meta: RwLock::new(meta),
                store,
                xmatched: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.meta.read().name.clone()
    }

    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    pub fn partitioning(&self) -> Partitioning {
        *self.inner.store.partitioning()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Row count of the primary table as of the last append or refresh.
    pub fn nrows(&self) -> u64 {
        self.inner.meta.read().nrows
    }

    pub fn primary_table(&self) -> Option<String> {
        self.inner.meta.read().primary_table.clone()
    }

    /// Snapshot of the catalog metadata.
    pub fn meta(&self) -> CatalogMeta {
        self.inner.meta.read().clone()
    }

    /// Table names, in name order.
    pub fn tables(&self) -> Vec<String> {
        self.inner.meta.read().tables.keys().cloned().collect()
    }

    pub fn table_schema(&self, table: &str) -> Result<TableSchema, Error> {
        self.inner
            .meta
            .read()
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| SchemaError::TableNotFound(table.to_string()).into())
    }

    pub(crate) fn store(&self) -> &CellStore {
        &self.inner.store
    }

    /// Apply `f` to the metadata and persist the result. The in-memory copy
    /// only changes if the sidecar was written.
    fn update_meta<R>(
        &self,
        f: impl FnOnce(&mut CatalogMeta) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut guard = self.inner.meta.write();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.store(&self.inner.root)?;
        *guard = next;
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    /// Start defining a new table.
    pub fn create_table(&self, name: &str) -> TableBuilder<'_> {
        TableBuilder::new(self, name.to_string())
    }

    pub(crate) fn register_table(
        &self,
        name: &str,
        mut schema: TableSchema,
        if_not_exists: bool,
    ) -> Result<(), Error> {
        let column_check = |schema: &TableSchema, column: &str| -> Result<(), Error> {
            if schema.has_column(column) {
                Ok(())
            } else {
                Err(SchemaError::ColumnNotFound {
                    table: name.to_string(),
                    column: column.to_string(),
                }
                .into())
            }
        };

        let created = self.update_meta(|meta| {
            if meta.tables.contains_key(name) {
                if if_not_exists {
                    return Ok(false);
                }
                return Err(SchemaError::TableAlreadyExists(name.to_string()).into());
            }
            if let Some(pk) = schema.primary_key.clone() {
                if let Some(existing) = &meta.primary_table {
                    return Err(SchemaError::PrimaryTableExists(existing.clone()).into());
                }
                let Some((ra, dec)) = schema.spatial_keys.clone() else {
                    return Err(SchemaError::MissingSpatialKeys(name.to_string()).into());
                };
                column_check(&schema, &pk)?;
                column_check(&schema, &ra)?;
                column_check(&schema, &dec)?;
                if let Some(t) = schema.temporal_key.clone() {
                    column_check(&schema, &t)?;
                }
                if !schema.has_column(CACHED_COLUMN) {
                    schema
                        .columns
                        .push((CACHED_COLUMN.to_string(), ColumnType::Bool));
                }
                meta.primary_table = Some(name.to_string());
            }
            meta.tables.insert(name.to_string(), schema.clone());
            Ok(true)
        })?;
        if created {
            info!(table = name, primary = schema.is_primary(), columns = schema.columns.len(), "created table");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append rows to `table`.
    ///
    /// Rows of the primary table are placed by their spatial (and temporal)
    /// keys and receive fresh row ids, which are returned in input order.
    /// Rows of other tables go where `target` says and return no ids.
    pub fn append(
        &self,
        table: &str,
        rows: &RowBlock,
        target: CellTarget,
    ) -> Result<Vec<RowId>, Error> {
        let meta = self.meta();
        let schema = meta
            .tables
            .get(table)
            .ok_or_else(|| SchemaError::TableNotFound(table.to_string()))?;
        let n = rows.len();
        let is_primary = meta.primary_table.as_deref() == Some(table);

        let (rows, cells) = if is_primary {
            let pk = schema.primary_key.as_deref().unwrap_or_default();
            let rows = rows.conform(schema, &[pk, CACHED_COLUMN])?;
            let cells = self.derive_cells(schema, &rows, table)?;
            (rows, cells)
        } else {
            let rows = rows.conform(schema, &[])?;
            let cells = match target {
                CellTarget::Derived => return Err(SchemaError::CellTargetRequired.into()),
                CellTarget::All(cell) => vec![cell.cell(); n],
                CellTarget::PerRow(cells) => {
                    if cells.len() != n {
                        return Err(SchemaError::CellTargetLength {
                            expected: n,
                            actual: cells.len(),
                        }
                        .into());
                    }
                    cells.into_iter().map(CellId::cell).collect()
                }
            };
            (rows, cells)
        };
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut by_cell: BTreeMap<CellId, Vec<usize>> = BTreeMap::new();
        for (i, cell) in cells.iter().enumerate() {
            by_cell.entry(*cell).or_default().push(i);
        }
        let groups: Vec<(CellId, RowBlock)> = by_cell
            .iter()
            .map(|(cell, idx)| (*cell, rows.take(idx)))
            .collect();
        let ncells = groups.len();
        let mut committed = 0u64;
        let appended = self
            .inner
            .store
            .append_groups_with(table, schema, groups, |_, rows| committed += rows as u64);
        let written = match appended {
            Ok(written) => written,
            Err(e) => {
                // Groups already on disk still count toward the catalog total.
                if is_primary && committed > 0 {
                    let nrows = self.update_meta(|meta| {
                        meta.nrows += committed;
                        Ok(meta.nrows)
                    })?;
                    warn!(table, committed, nrows, error = %e, "append stopped part way");
                }
                return Err(e.into());
            }
        };

        if !is_primary {
            info!(table, rows = n, cells = ncells, "appended rows");
            return Ok(Vec::new());
        }

        let nrows = self.update_meta(|meta| {
            meta.nrows += n as u64;
            Ok(meta.nrows)
        })?;
        let ids = place_ids(n, written, &by_cell)?;
        info!(table, rows = n, cells = ncells, nrows, "appended rows");
        Ok(ids)
    }

    fn derive_cells(
        &self,
        schema: &TableSchema,
        rows: &RowBlock,
        table: &str,
    ) -> Result<Vec<CellId>, Error> {
        let missing = |column: &str| SchemaError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        };
        let (ra_key, dec_key) = schema
            .spatial_keys
            .as_ref()
            .ok_or_else(|| SchemaError::MissingSpatialKeys(table.to_string()))?;
        let ra = rows.column(ra_key).ok_or_else(|| missing(ra_key))?.to_f64_vec();
        let dec = rows.column(dec_key).ok_or_else(|| missing(dec_key))?.to_f64_vec();
        let t = match &schema.temporal_key {
            Some(key) => Some(rows.column(key).ok_or_else(|| missing(key))?.to_f64_vec()),
            None => None,
        };
        let partitioning = self.partitioning();
        Ok((0..rows.len())
            .map(|i| partitioning.cell_for_pos(ra[i], dec[i], t.as_ref().map(|t| t[i])))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Cell primitives
    // -----------------------------------------------------------------------

    /// All rows of one cell of `table` (the primary table if `None`).
    ///
    /// Cached rows of the primary table are dropped unless `include_cached`.
    /// A cell that was never written reads as an empty block.
    pub fn fetch_cell(
        &self,
        cell: CellId,
        table: Option<&str>,
        include_cached: bool,
    ) -> Result<RowBlock, Error> {
        let meta = self.inner.meta.read();
        let table = match table {
            Some(t) => t.to_string(),
            None => meta.primary_table.clone().ok_or(SchemaError::NoPrimaryTable)?,
        };
        let schema = meta
            .tables
            .get(&table)
            .ok_or_else(|| SchemaError::TableNotFound(table.clone()))?;
        let is_primary = meta.primary_table.as_deref() == Some(table.as_str());
        let rows = match self.inner.store.read(cell, &table)? {
            Some(rows) => rows,
            None => RowBlock::empty(&schema.columns),
        };
        if include_cached || !is_primary {
            return Ok(rows);
        }
        match rows.column(CACHED_COLUMN) {
            Some(cached) => {
                let keep: Vec<bool> = cached.to_bool_vec().into_iter().map(|c| !c).collect();
                Ok(rows.filter(&keep))
            }
            None => Ok(rows),
        }
    }

    /// Cell containing `(ra, dec)` at time `t`.
    pub fn cell_for_pos(&self, ra: f64, dec: f64, t: Option<f64>) -> CellId {
        self.partitioning().cell_for_pos(ra, dec, t)
    }

    /// Cell holding the row with id `id`.
    pub fn cell_for_id(&self, id: RowId) -> CellId {
        CellId(id).cell()
    }

    /// Planar outline of a cell and the start time of its slice.
    pub fn cell_bounds(&self, cell: CellId) -> (Polygon, f64) {
        let p = self.partitioning();
        let d = p.decode(cell);
        (sky::pixel_bounds(d.x, d.y, sky::pix_size(p.level)), d.t)
    }

    /// Cells adjacent to `cell` in space and, with a time axis, in time.
    pub fn neighboring_cells(&self, cell: CellId, include_self: bool) -> Vec<CellId> {
        let p = self.partitioning();
        let d = p.decode(cell);
        let spatial = sky::neighbors(d.x, d.y, p.level, include_self);
        let mut out: Vec<CellId> = spatial
            .iter()
            .map(|&(x, y)| p.cell_for_xy_slice(x, y, d.slice))
            .collect();
        if p.has_time_axis() && d.slice != 0 {
            // Slice 0 is the static slice, not a temporal neighbor of slice 1.
            let slices = [d.slice + 1, d.slice - 1]
                .into_iter()
                .filter(|&s| (1..=MAX_SLICE).contains(&s));
            for slice in slices {
                out.extend(spatial.iter().map(|&(x, y)| p.cell_for_xy_slice(x, y, slice)));
            }
        }
        let mut seen = HashSet::with_capacity(out.len());
        out.retain(|c| seen.insert(*c));
        out
    }

    /// Whether `cell` has a tablet for `table` (the primary table if `None`).
    pub fn cell_exists(&self, cell: CellId, table: Option<&str>) -> bool {
        let table = match table {
            Some(t) => t.to_string(),
            None => match self.primary_table() {
                Some(t) => t,
                None => return false,
            },
        };
        self.inner.store.cell_exists(cell, &table)
    }

    /// Cells of the primary table overlapping `footprint`.
    ///
    /// With `test_bounds` off, partially covered cells are reported without
    /// their residual footprint and queries return every row of the cell.
    pub fn resolve_cells(
        &self,
        footprint: &Footprint,
        test_bounds: bool,
    ) -> Result<Vec<Partition>, Error> {
        let table = self.primary_table().ok_or(SchemaError::NoPrimaryTable)?;
        let mut parts = resolve(&self.inner.store, &table, footprint)?;
        if !test_bounds {
            for part in &mut parts {
                part.bounds = None;
            }
        }
        Ok(parts)
    }

    // -----------------------------------------------------------------------
    // Cross-matching
    // -----------------------------------------------------------------------

    /// Register `other` as joinable through link table `link_table`
    /// (`id1` in this catalog, `id2` in `other`), creating the table if needed.
    pub fn add_xmatch(&self, other: &Catalog, link_table: &str) -> Result<(), Error> {
        let other_name = other.name();
        if self.partitioning() != other.partitioning() {
            return Err(SchemaError::PartitioningMismatch(other_name).into());
        }
        let schema = TableSchema::new(vec![
            ("id1".to_string(), ColumnType::U64),
            ("id2".to_string(), ColumnType::U64),
        ]);
        self.register_table(link_table, schema, true)?;
        let path = other.path().to_path_buf();
        self.update_meta(|meta| {
            meta.xmatch.insert(
                other_name.clone(),
                XmatchEntry {
                    path,
                    table: link_table.to_string(),
                },
            );
            Ok(())
        })?;
        self.inner
            .xmatched
            .lock()
            .insert(other_name.clone(), other.clone());
        info!(catalog = %self.name(), other = %other_name, link_table, "registered cross-match");
        Ok(())
    }

    /// The cross-matched catalog registered under `name`.
    pub fn xmatched_catalog(&self, name: &str) -> Result<Catalog, Error> {
        let mut cache = self.inner.xmatched.lock();
        if let Some(cat) = cache.get(name) {
            return Ok(cat.clone());
        }
        let entry = self
            .inner
            .meta
            .read()
            .xmatch
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownCatalog(name.to_string()))?;
        let path = if entry.path.is_absolute() {
            entry.path
        } else {
            self.inner.root.join(entry.path)
        };
        let cat = Catalog::open_with_config(path, self.inner.config.clone())?;
        cache.insert(name.to_string(), cat.clone());
        Ok(cat)
    }

    /// Record matches `id1[k] ↔ id2[k]` against catalog `other`. Each link
    /// is stored in the cell of its `id1`.
    pub fn append_xmatches(&self, other: &str, id1: &[RowId], id2: &[RowId]) -> Result<(), Error> {
        if id1.len() != id2.len() {
            return Err(QueryError::LengthMismatch {
                expected: id1.len(),
                actual: id2.len(),
            }
            .into());
        }
        let table = self
            .inner
            .meta
            .read()
            .xmatch
            .get(other)
            .map(|x| x.table.clone())
            .ok_or_else(|| SchemaError::UnknownCatalog(other.to_string()))?;
        let rows = RowBlock::new()
            .with_column("id1", ColumnType::U64, id1.to_vec())?
            .with_column("id2", ColumnType::U64, id2.to_vec())?;
        let cells = id1.iter().map(|&id| CellId(id).cell()).collect();
        self.append(&table, &rows, CellTarget::PerRow(cells))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Start a query job over this catalog.
    pub fn query(&self, query: Query) -> JobBuilder {
        JobBuilder::new(self.clone(), query)
    }

    /// Recount the primary table's rows with a map job and persist the count.
    pub fn refresh_row_count(&self) -> Result<u64, Error> {
        let meta = self.meta();
        let pk = meta
            .primary_schema()
            .and_then(|s| s.primary_key.clone())
            .ok_or(SchemaError::NoPrimaryTable)?;
        let mut total = 0u64;
        for n in self
            .query(Query::select(&pk))
            .map(|_, rows| Ok(Contribution::one(rows.len() as u64)))?
        {
            total += n?;
        }
        self.update_meta(|meta| {
            meta.nrows = total;
            Ok(())
        })?;
        info!(catalog = %meta.name, nrows = total, "refreshed row count");
        Ok(total)
    }

    /// Rebuild the neighbor cache with the default 30 arcsec margin and no
    /// temporal margin.
    pub fn build_neighbor_cache(&self) -> Result<HaloStats, Error> {
        self.build_neighbor_cache_with(DEFAULT_MARGIN_ARCSEC, 0.0)
    }

    /// Rebuild the neighbor cache: replicate rows within `margin_arcsec` of a
    /// cell edge (and, if `margin_t_days > 0`, within that many days of a
    /// slice boundary) into every neighboring cell.
    pub fn build_neighbor_cache_with(
        &self,
        margin_arcsec: f64,
        margin_t_days: f64,
    ) -> Result<HaloStats, Error> {
        halo::build(self, HaloMargin::new(margin_arcsec, margin_t_days))
    }
}

/// Scatter the ids assigned per cell group back into input row order,
/// checking that every id is unique and lives in the cell it was written to.
fn place_ids(
    n: usize,
    written: Vec<(CellId, Vec<RowId>)>,
    by_cell: &BTreeMap<CellId, Vec<usize>>,
) -> Result<Vec<RowId>, StorageError> {
    let mut ids = vec![0u64; n];
    let mut seen: HashSet<RowId> = HashSet::with_capacity(n);
    for ((cell, group_ids), idx) in written.into_iter().zip(by_cell.values()) {
        if group_ids.len() != idx.len() {
            return Err(StorageError::InvariantViolation(format!(
                "cell {cell} assigned {} ids to {} rows",
                group_ids.len(),
                idx.len()
            )));
        }
        for (id, &i) in group_ids.into_iter().zip(idx) {
            if CellId(id).cell() != cell {
                return Err(StorageError::InvariantViolation(format!(
                    "row id {id:#x} does not belong to cell {cell}"
                )));
            }
            if !seen.insert(id) {
                return Err(StorageError::InvariantViolation(format!(
                    "row id {id:#x} assigned twice"
                )));
            }
            ids[i] = id;
        }
    }
    Ok(ids)
}

impl fmt::Display for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.inner.meta.read();
        writeln!(f, "Path:         {}", self.inner.root.display())?;
        writeln!(f, "Partitioning: level={}", meta.level)?;
        writeln!(f, "(t0, dt):     {:.6}, {:.6}", meta.t0, meta.dt)?;
        writeln!(f, "Objects:      {}", meta.nrows)?;
        let names: Vec<&str> = meta.tables.keys().map(String::as_str).collect();
        writeln!(f, "Tables:       {}", names.join(", "))?;
        let rule = "-".repeat(31);
        for (name, schema) in &meta.tables {
            writeln!(f, "{rule}")?;
            writeln!(f, "Table '{name}':")?;
            writeln!(f, "{:>20} {:>10}", "Column", "Type")?;
            writeln!(f, "{rule}")?;
            for (column, ty) in &schema.columns {
                writeln!(f, "{column:>20} {:>10}", ty.code())?;
            }
            writeln!(f, "{rule}")?;
        }
        Ok(())
    }
}
