//! Neighbor (halo) cache: replicate rows near a cell's edge into the
//! neighboring cells so proximity queries can run cell-locally.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::api::Catalog;
use crate::error::{Error, Result, SchemaError, StorageError};
use crate::geometry::{Polygon, sky};
use crate::query::Query;
use crate::table::{ColumnData, RowBlock};
use crate::types::{CACHED_COLUMN, CellId, ColumnType, TableSchema};

use super::{Contribution, MapContext, ReduceContext};

/// Default spatial margin, in arcseconds.
pub const DEFAULT_MARGIN_ARCSEC: f64 = 30.0;

/// Outcome of a halo rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaloStats {
    /// Cells whose cache was rewritten.
    pub cells: usize,
    /// Rows replicated into those cells.
    pub cached_rows: u64,
}

/// Rows of every aligned table selected for replication from one cell.
pub type HaloRows = Arc<HashMap<String, RowBlock>>;

/// Margin parameters in plane units and days.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaloMargin {
    pub x: f64,
    pub t: f64,
}

impl HaloMargin {
    /// Convert an angular margin in arcseconds to plane units.
    pub fn new(margin_arcsec: f64, margin_t_days: f64) -> Self {
        Self {
            x: 2f64.sqrt() / 180.0 * (margin_arcsec / 3600.0),
            t: margin_t_days,
        }
    }
}

const AXIS_EPS: f64 = 1e-12;

/// The part of a cell farther than `margin` from every edge rows could be
/// needed across. Triangles keep their pole diagonal; the seam diagonal is
/// inset like the axis-aligned edges.
pub fn inner_polygon(bounds: &Polygon, margin: f64) -> Polygon {
    let rectangle = bounds.n_points() == 4;
    bounds.inset_edges(margin, |_, a, b| {
        let axis = (a.0 - b.0).abs() < AXIS_EPS || (a.1 - b.1).abs() < AXIS_EPS;
        rectangle || axis || sky::on_seam(a, b)
    })
}

fn column<'r>(rows: &'r RowBlock, table: &str, name: &str) -> Result<&'r ColumnData> {
    rows.column(name).ok_or_else(|| {
        Error::from(SchemaError::ColumnNotFound {
            table: table.to_string(),
            column: name.to_string(),
        })
    })
}

/// Bring an aligned table up to `len` rows. Rows the table never received
/// read as zeros, the same way queries see them.
fn pad_aligned(
    rows: RowBlock,
    len: usize,
    schema: &TableSchema,
    table: &str,
    cell: CellId,
) -> Result<RowBlock> {
    match rows.len().cmp(&len) {
        Ordering::Equal => Ok(rows),
        Ordering::Less if rows.is_empty() => Ok(RowBlock::zeroed(&schema.columns, len)),
        Ordering::Less => {
            let mut rows = rows.conform(schema, &[])?;
            rows.append(&RowBlock::zeroed(&schema.columns, len - rows.len()))?;
            Ok(rows)
        }
        Ordering::Greater => Err(StorageError::InvariantViolation(format!(
            "table {table} of cell {cell} has {} rows, primary has {len}",
            rows.len()
        ))
        .into()),
    }
}

/// Map phase: pick non-cached rows in the cell's margin and emit them to
/// every neighboring cell.
pub fn halo_mapper(
    ctx: &MapContext,
    margin: HaloMargin,
) -> Result<Contribution<(CellId, HaloRows)>> {
    let cat = &ctx.catalog;
    let meta = cat.meta();
    let primary = meta.primary_table.clone().ok_or(SchemaError::NoPrimaryTable)?;
    let schema = meta.primary_schema().ok_or(SchemaError::NoPrimaryTable)?;
    let (ra_key, dec_key) = schema
        .spatial_keys
        .clone()
        .ok_or_else(|| SchemaError::MissingSpatialKeys(primary.clone()))?;

    let raw = cat.fetch_cell(ctx.cell_id, Some(&primary), true)?;
    if raw.is_empty() {
        return Ok(Contribution::Skip);
    }
    let (bounds, t_start) = cat.cell_bounds(ctx.cell_id);
    let inner = inner_polygon(&bounds, margin.x);

    let ra = column(&raw, &primary, &ra_key)?.to_f64_vec();
    let dec = column(&raw, &primary, &dec_key)?.to_f64_vec();
    let mut mask: Vec<bool> = ra
        .iter()
        .zip(&dec)
        .map(|(&ra, &dec)| {
            let (x, y) = sky::project(ra, dec);
            !inner.contains(x, y)
        })
        .collect();
    if let Some(cached) = raw.column(CACHED_COLUMN) {
        for (m, c) in mask.iter_mut().zip(cached.to_bool_vec()) {
            *m &= !c;
        }
    }
    let dt = meta.dt;
    if margin.t > 0.0
        && dt > 0.0
        && let Some(t_key) = &schema.temporal_key
    {
        let t_end = t_start + dt;
        let t = column(&raw, &primary, t_key)?.to_f64_vec();
        for (m, t) in mask.iter_mut().zip(t) {
            *m &= (t - t_start).min(t_end - t) < margin.t;
        }
    }
    if !mask.iter().any(|&m| m) {
        return Ok(Contribution::Skip);
    }

    let mut rows = HashMap::new();
    for table in meta.aligned_tables() {
        let block = if table == primary {
            raw.filter(&mask)
        } else {
            let schema = meta
                .tables
                .get(&table)
                .ok_or_else(|| SchemaError::TableNotFound(table.clone()))?;
            let all = cat.fetch_cell(ctx.cell_id, Some(&table), true)?;
            pad_aligned(all, raw.len(), schema, &table, ctx.cell_id)?.filter(&mask)
        };
        rows.insert(table, block);
    }
    let rows: HaloRows = Arc::new(rows);
    debug!(cell = %ctx.cell_id, rows = mask.iter().filter(|&&m| m).count(), "collected halo rows");

    Ok(cat
        .neighboring_cells(ctx.cell_id, false)
        .into_iter()
        .map(|n| (n, Arc::clone(&rows)))
        .collect::<Vec<_>>()
        .into())
}

/// Reduce phase: replace the cached rows of `cell` with `blocks`.
///
/// Every aligned table of the cell is locked before any is rewritten. Cells
/// with no primary tablet are left alone and reported as `None`.
pub fn halo_reducer(
    ctx: &ReduceContext,
    cell: CellId,
    blocks: Vec<HaloRows>,
) -> Result<Option<(CellId, u64)>> {
    let cat = &ctx.catalog;
    let meta = cat.meta();
    let primary = meta.primary_table.clone().ok_or(SchemaError::NoPrimaryTable)?;
    if !cat.cell_exists(cell, Some(&primary)) {
        return Ok(None);
    }
    let store = cat.store();

    let mut writers = Vec::new();
    for table in meta.aligned_tables() {
        let schema = meta
            .tables
            .get(&table)
            .ok_or_else(|| SchemaError::TableNotFound(table.clone()))?;
        writers.push((table.clone(), schema, store.open_write(cell, &table, schema)?));
    }

    let current = writers[0].2.tablet().read_all()?;
    let keep: Vec<bool> = match current.column(CACHED_COLUMN) {
        Some(c) => c.to_bool_vec().into_iter().map(|c| !c).collect(),
        None => vec![true; current.len()],
    };

    let mut cached_rows = 0u64;
    for (table, schema, writer) in &mut writers {
        let existing = writer.tablet().read_all()?;
        let mut rows = pad_aligned(existing, keep.len(), schema, table, cell)?
            .filter(&keep)
            .conform(schema, &[])?;
        for block in &blocks {
            let incoming = block.get(primary.as_str()).map_or(0, RowBlock::len);
            let mut new = match block.get(table.as_str()) {
                Some(new) => pad_aligned(new.clone(), incoming, schema, table, cell)?,
                None => RowBlock::zeroed(&schema.columns, incoming),
            };
            if *table == primary {
                new.push_column(CACHED_COLUMN, ColumnType::Bool, vec![true; new.len()])?;
                cached_rows += new.len() as u64;
            }
            rows.append(&new.conform(schema, &[])?)?;
        }
        writer.rewrite(&rows.conform(schema, &[])?)?;
    }
    debug!(cell = %cell, cached_rows, "rewrote halo cache");
    Ok(Some((cell, cached_rows)))
}

/// Run the full rebuild and total up the result.
pub(crate) fn build(catalog: &Catalog, margin: HaloMargin) -> Result<HaloStats> {
    let stream = catalog
        .query(Query::all())
        .map_reduce(move |ctx, _rows| halo_mapper(ctx, margin), halo_reducer)?;
    let mut stats = HaloStats::default();
    for item in stream {
        if let Some((cell, n)) = item? {
            info!(cell = %cell, cached = n, "cached neighbor rows");
            stats.cells += 1;
            stats.cached_rows += n;
        }
    }
    info!(cells = stats.cells, cached_rows = stats.cached_rows, "neighbor cache rebuilt");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_margin_conversion() {
        let m = HaloMargin::new(3600.0, 0.0);
        assert!((m.x - 2f64.sqrt() / 180.0).abs() < 1e-15);
    }

    #[test]
    fn test_inner_polygon_of_square() {
        let sq = Polygon::square(0.25, 0.25, 0.5);
        let inner = inner_polygon(&sq, 0.05);
        assert!((inner.area() - 0.4 * 0.4).abs() < 1e-12);
        assert!(inner.contains(0.25, 0.25));
        assert!(!inner.contains(0.02, 0.25));
    }

    #[test]
    fn test_inner_polygon_of_pole_triangle_keeps_diagonal() {
        // Half-pixel on the NW (pole) edge: the diagonal is not inset.
        let tri = sky::pixel_bounds(-0.25, 0.75, 0.5);
        assert_eq!(tri.n_points(), 3);
        let inner = inner_polygon(&tri, 0.01);
        // A point hugging the pole diagonal stays inside.
        assert!(inner.contains(-0.35, 0.64));
        // A point hugging an axis-aligned edge does not.
        assert!(!inner.contains(-0.2, 0.505));
    }

    #[test]
    fn test_inner_polygon_of_seam_triangle_insets_diagonal() {
        let tri = sky::pixel_bounds(0.75, 0.25, 0.5);
        assert_eq!(tri.n_points(), 3);
        let inner = inner_polygon(&tri, 0.01);
        // Just inside the seam diagonal x + y = 1.
        assert!(!inner.contains(0.7, 0.295));
        assert!(inner.contains(0.6, 0.2));
    }
}
