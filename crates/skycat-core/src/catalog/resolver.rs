//! Footprint to cell resolution.

use crate::error::StorageError;
use crate::geometry::{Footprint, sky};
use crate::storage::CellStore;
use crate::types::CellId;

/// One unit of parallel work: a cell and, if the cell is only partially
/// covered by the query footprint, the part of it that is.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub cell_id: CellId,
    /// `None` when the whole cell lies inside the footprint.
    pub bounds: Option<Footprint>,
}

/// Find the cells of `table` overlapping `footprint`.
///
/// Walks the pixel quadtree from the root, pruning pixels that miss the
/// footprint or have no storage directory, and stops at the first level that
/// holds tablets. Each match is reported once per time slice present.
pub fn resolve(
    store: &CellStore,
    table: &str,
    footprint: &Footprint,
) -> Result<Vec<Partition>, StorageError> {
    let foot = footprint.intersect_polygon(&sky::valid_sky());
    let mut out = Vec::new();
    if !foot.is_empty() && store.root().is_dir() {
        let mut path = Vec::new();
        descend(store, table, &foot, (0.0, 0.0), 2.0, &mut path, &mut out)?;
    }
    Ok(out)
}

fn descend(
    store: &CellStore,
    table: &str,
    foot: &Footprint,
    center: (f64, f64),
    dx: f64,
    path: &mut Vec<String>,
    out: &mut Vec<Partition>,
) -> Result<(), StorageError> {
    let bounds = sky::pixel_bounds(center.0, center.1, dx);
    let foot = foot.intersect_polygon(&bounds);
    if foot.is_empty() {
        return Ok(());
    }

    let slices = store.slices_at(path, table)?;
    if !slices.is_empty() {
        let residual = if sky::same_area(foot.area(), bounds.area()) {
            None
        } else {
            Some(foot)
        };
        let partitioning = store.partitioning();
        for slice in slices {
            out.push(Partition {
                cell_id: partitioning.cell_for_xy_slice(center.0, center.1, slice),
                bounds: residual.clone(),
            });
        }
        return Ok(());
    }

    if path.len() as u32 >= store.partitioning().level || !store.children_dir(path).is_dir() {
        return Ok(());
    }

    for (cx, cy) in sky::children(center.0, center.1, dx) {
        let code = format!("{}{}", u8::from(cx > center.0), u8::from(cy > center.1));
        path.push(code);
        descend(store, table, &foot, (cx, cy), 0.5 * dx, path, out)?;
        path.pop();
    }
    Ok(())
}
