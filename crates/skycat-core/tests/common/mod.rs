//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;

use skycat_core::api::{Catalog, CellTarget};
use skycat_core::encoding::Partitioning;
use skycat_core::geometry::sky;
use skycat_core::table::RowBlock;
use skycat_core::types::{CellId, ColumnType, RowId};

/// Create a catalog with an `objects` primary table
/// (`id`, `ra`, `dec`, `mag`, `t`).
pub fn survey(root: &Path, name: &str, partitioning: Partitioning) -> Catalog {
    let cat = Catalog::create(root, name, partitioning).unwrap();
    cat.create_table("objects")
        .column("id", ColumnType::U64)
        .column("ra", ColumnType::F64)
        .column("dec", ColumnType::F64)
        .column("mag", ColumnType::F32)
        .column("t", ColumnType::F64)
        .primary_key("id")
        .spatial_keys("ra", "dec")
        .temporal_key("t")
        .execute()
        .unwrap();
    cat
}

/// Add an `astrometry` table (`pmra`, `pmdec`) row-aligned with `objects`.
pub fn with_astrometry(cat: &Catalog) {
    cat.create_table("astrometry")
        .column("pmra", ColumnType::F32)
        .column("pmdec", ColumnType::F32)
        .execute()
        .unwrap();
}

/// Append astrometry for the objects of `cell`, in their insertion order.
pub fn add_astrometry(cat: &Catalog, cell: CellId, pmra: &[f64]) {
    let rows = RowBlock::new()
        .with_column("pmra", ColumnType::F32, pmra.to_vec())
        .unwrap()
        .with_column("pmdec", ColumnType::F32, vec![0.5; pmra.len()])
        .unwrap();
    cat.append("astrometry", &rows, CellTarget::All(cell)).unwrap();
}

/// Rows for the `objects` table.
pub fn objects(pos: &[(f64, f64)], mag: &[f64], t: &[f64]) -> RowBlock {
    RowBlock::new()
        .with_column("ra", ColumnType::F64, pos.iter().map(|p| p.0).collect::<Vec<_>>())
        .unwrap()
        .with_column("dec", ColumnType::F64, pos.iter().map(|p| p.1).collect::<Vec<_>>())
        .unwrap()
        .with_column("mag", ColumnType::F32, mag.to_vec())
        .unwrap()
        .with_column("t", ColumnType::F64, t.to_vec())
        .unwrap()
}

/// Append objects with constant magnitude and time.
pub fn add_objects(cat: &Catalog, pos: &[(f64, f64)], mag: f64, t: f64) -> Vec<RowId> {
    let rows = objects(pos, &vec![mag; pos.len()], &vec![t; pos.len()]);
    cat.append("objects", &rows, CellTarget::Derived).unwrap()
}

/// Deterministic pseudo-random sky positions spread over the whole sphere.
pub fn scatter(n: usize, seed: u64) -> Vec<(f64, f64)> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    (0..n)
        .map(|_| {
            let ra = next() * 360.0;
            let dec = (2.0 * next() - 1.0).asin().to_degrees();
            (ra, dec)
        })
        .collect()
}

/// Sky position of a planar point.
pub fn at_xy(x: f64, y: f64) -> (f64, f64) {
    sky::deproject(x, y)
}
