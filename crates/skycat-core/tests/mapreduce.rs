//! Integration tests for map / map-reduce jobs and the neighbor cache.

mod common;

use std::collections::{BTreeMap, HashSet};

use skycat_core::api::{Catalog, CellTarget};
use skycat_core::encoding::Partitioning;
use skycat_core::error::{Error, JobError};
use skycat_core::mapreduce::{Contribution, HaloStats};
use skycat_core::query::Query;
use skycat_core::types::CellId;
use tempfile::tempdir;

use common::{add_astrometry, add_objects, at_xy, objects, scatter, survey, with_astrometry};

/// Stock `cat` with `n` objects of magnitude `15 + i % 6`.
fn stock(cat: &Catalog, n: usize) -> BTreeMap<i64, u64> {
    let pos = scatter(n, 1234);
    let mag: Vec<f64> = (0..n).map(|i| 15.0 + (i % 6) as f64).collect();
    cat.append("objects", &objects(&pos, &mag, &vec![50000.0; n]), CellTarget::Derived)
        .unwrap();
    let mut expected = BTreeMap::new();
    for m in &mag {
        *expected.entry(*m as i64).or_insert(0) += 1;
    }
    expected
}

fn magnitude_histogram(cat: &Catalog, workers: usize) -> BTreeMap<i64, u64> {
    let stream = cat
        .query(Query::select("mag"))
        .workers(workers)
        .map_reduce(
            |_, rows| {
                let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
                for m in rows.column("mag").unwrap().to_f64_vec() {
                    *counts.entry(m as i64).or_insert(0) += 1;
                }
                Ok(Contribution::Emit(counts.into_iter().collect()))
            },
            |_, key, values: Vec<u64>| Ok((key, values.iter().sum::<u64>())),
        )
        .unwrap();
    stream.map(|r| r.unwrap()).collect()
}

#[test]
fn test_histogram_matches_direct_count() {
    let dir = tempdir().unwrap();
    let cat = survey(dir.path(), "sdss", Partitioning::new(6, 0.0, 0.0).unwrap());
    let expected = stock(&cat, 600);

    assert_eq!(magnitude_histogram(&cat, 1), expected);
    assert_eq!(magnitude_histogram(&cat, 4), expected);
}

#[test]
fn test_result_independent_of_partitioning() {
    let (coarse_dir, fine_dir) = (tempdir().unwrap(), tempdir().unwrap());
    let coarse = survey(coarse_dir.path(), "coarse", Partitioning::new(1, 0.0, 0.0).unwrap());
    let fine = survey(fine_dir.path(), "fine", Partitioning::new(7, 0.0, 0.0).unwrap());
    let expected = stock(&coarse, 500);
    stock(&fine, 500);

    let cells = |cat: &Catalog| {
        cat.resolve_cells(&skycat_core::geometry::Footprint::all_sky(), true)
            .unwrap()
            .len()
    };
    assert!(cells(&coarse) <= 4);
    assert!(cells(&fine) > 100);

    assert_eq!(magnitude_histogram(&coarse, 3), expected);
    assert_eq!(magnitude_histogram(&fine, 3), expected);
}

#[test]
fn test_failed_partitions_are_reported_and_skipped() {
    let dir = tempdir().unwrap();
    let cat = survey(dir.path(), "sdss", Partitioning::new(4, 0.0, 0.0).unwrap());
    let a = add_objects(&cat, &[(10.0, 10.0); 3], 20.0, 50000.0);
    let b = add_objects(&cat, &[(100.0, -40.0); 2], 20.0, 50000.0);
    let c = add_objects(&cat, &[(250.0, 60.0); 4], 20.0, 50000.0);
    let (bad, broken) = (cat.cell_for_id(a[0]), cat.cell_for_id(b[0]));

    let results: Vec<_> = cat
        .query(Query::select("id"))
        .workers(2)
        .map(move |ctx, rows| {
            if ctx.cell_id == bad {
                return Err(Error::Callback("bad cell".into()));
            }
            if ctx.cell_id == broken {
                panic!("broken cell");
            }
            Ok(Contribution::one(rows.len()))
        })
        .unwrap()
        .collect();

    let delivered: Vec<usize> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(delivered, vec![c.len()]);

    let failed: HashSet<CellId> = results
        .iter()
        .filter_map(|r| match r {
            Err(Error::Job(JobError::Partition { cell_id, message })) => {
                assert!(message.contains("cell"));
                Some(*cell_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(failed, HashSet::from([bad, broken]));
}

#[test]
fn test_reducer_failure_is_reported_per_key() {
    let dir = tempdir().unwrap();
    let cat = survey(dir.path(), "sdss", Partitioning::new(5, 0.0, 0.0).unwrap());
    stock(&cat, 120);

    let results: Vec<_> = cat
        .query(Query::select("mag"))
        .map_reduce(
            |_, rows| {
                let pairs: Vec<(i64, f64)> = rows
                    .column("mag")
                    .unwrap()
                    .to_f64_vec()
                    .into_iter()
                    .map(|m| (m as i64, m))
                    .collect();
                Ok(Contribution::Emit(pairs))
            },
            |_, key, values: Vec<f64>| {
                if key == 17 {
                    return Err(Error::Callback("no seventeens".into()));
                }
                Ok((key, values.len()))
            },
        )
        .unwrap()
        .collect();

    assert_eq!(results.len(), 6);
    let errors: Vec<&Error> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::Job(JobError::Reduce(m)) if m.starts_with("key 17")));
    let ok: u64 = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|(_, n)| *n as u64)
        .sum();
    assert_eq!(ok, 100);
}

#[test]
fn test_dropping_a_stream_early_is_clean() {
    let dir = tempdir().unwrap();
    let cat = survey(dir.path(), "sdss", Partitioning::new(6, 0.0, 0.0).unwrap());
    stock(&cat, 300);

    let mut blocks = cat.query(Query::all()).workers(2).iterate().unwrap();
    assert!(!blocks.next().unwrap().unwrap().is_empty());
    drop(blocks);

    assert_eq!(cat.query(Query::select("id")).fetch().unwrap().len(), 300);
}

#[test]
fn test_neighbor_cache_replicates_edge_rows() {
    let dir = tempdir().unwrap();
    // Level 3 pixels are 0.25 on a side; (0, 0)-(0.25, 0.25) is one of them.
    let cat = survey(dir.path(), "sdss", Partitioning::new(3, 0.0, 0.0).unwrap());
    let center = add_objects(&cat, &[at_xy(0.125, 0.125)], 20.0, 50000.0);
    let edge = add_objects(&cat, &[at_xy(0.248, 0.125)], 20.0, 50000.0);
    let next_door = add_objects(&cat, &[at_xy(0.375, 0.125)], 20.0, 50000.0);
    let (home, neighbor) = (cat.cell_for_id(center[0]), cat.cell_for_id(next_door[0]));
    assert_eq!(cat.cell_for_id(edge[0]), home);
    assert!(cat.neighboring_cells(home, false).contains(&neighbor));

    // One degree of margin comfortably covers the edge object only.
    let stats = cat.build_neighbor_cache_with(3600.0, 0.0).unwrap();
    assert_eq!(stats, HaloStats { cells: 1, cached_rows: 1 });

    let cached = cat.fetch_cell(neighbor, None, true).unwrap();
    assert_eq!(cached.column("id").unwrap().to_u64_vec(), vec![next_door[0], edge[0]]);
    assert_eq!(cached.column("cached").unwrap().to_bool_vec(), vec![false, true]);
    assert_eq!(cat.fetch_cell(neighbor, None, false).unwrap().len(), 1);

    assert_eq!(cat.query(Query::select("id")).fetch().unwrap().len(), 3);
    let with_cache = cat
        .query(Query::select("id cached"))
        .include_cached(true)
        .fetch()
        .unwrap();
    assert_eq!(with_cache.len(), 4);
    assert_eq!(cat.refresh_row_count().unwrap(), 3);

    // Rebuilding replaces the cache instead of stacking on it.
    let again = cat.build_neighbor_cache_with(3600.0, 0.0).unwrap();
    assert_eq!(again, stats);
    assert_eq!(cat.fetch_cell(neighbor, None, true).unwrap().len(), 2);
}

#[test]
fn test_temporal_margin_limits_replication() {
    let dir = tempdir().unwrap();
    let cat = survey(dir.path(), "sdss", Partitioning::new(3, 0.0, 100.0).unwrap());
    // Both objects sit next to the shared pixel edge; only one is near a
    // slice boundary.
    let (x, y) = (0.248, 0.125);
    let early = add_objects(&cat, &[at_xy(x, y)], 20.0, 102.0);
    let mid = add_objects(&cat, &[at_xy(x, y + 0.01)], 20.0, 150.0);
    let home = cat.cell_for_id(early[0]);
    assert_eq!(cat.cell_for_id(mid[0]), home);
    assert_eq!(home.time_slice(), 1);
    let neighbor = cat.cell_for_pos(at_xy(0.375, 0.125).0, at_xy(0.375, 0.125).1, Some(150.0));
    add_objects(&cat, &[at_xy(0.375, 0.125)], 20.0, 150.0);

    let stats = cat.build_neighbor_cache_with(3600.0, 5.0).unwrap();
    assert_eq!(stats.cached_rows, 1);
    let ids = cat.fetch_cell(neighbor, None, true).unwrap();
    assert!(ids.column("id").unwrap().to_u64_vec().contains(&early[0]));
}

/// A level 3 catalog with `objects` and `astrometry`: two objects in one
/// pixel (one hugging its east edge) and one in the pixel next door.
/// Returns the catalog, the three ids, and the (home, neighbor) cells.
fn edge_pair(root: &std::path::Path) -> (Catalog, [u64; 3], CellId, CellId) {
    let cat = survey(root, "sdss", Partitioning::new(3, 0.0, 0.0).unwrap());
    with_astrometry(&cat);
    let center = add_objects(&cat, &[at_xy(0.125, 0.125)], 20.0, 50000.0)[0];
    let edge = add_objects(&cat, &[at_xy(0.248, 0.125)], 20.0, 50000.0)[0];
    let next_door = add_objects(&cat, &[at_xy(0.375, 0.125)], 20.0, 50000.0)[0];
    let (home, neighbor) = (cat.cell_for_id(center), cat.cell_for_id(next_door));
    (cat, [center, edge, next_door], home, neighbor)
}

#[test]
fn test_neighbor_cache_carries_aux_rows() {
    let dir = tempdir().unwrap();
    let (cat, [_, edge, next_door], home, neighbor) = edge_pair(dir.path());
    add_astrometry(&cat, home, &[1.0, 7.0]);
    add_astrometry(&cat, neighbor, &[3.0]);

    let stats = cat.build_neighbor_cache_with(3600.0, 0.0).unwrap();
    assert_eq!(stats, HaloStats { cells: 1, cached_rows: 1 });

    let ids = cat.fetch_cell(neighbor, None, true).unwrap();
    let pm = cat.fetch_cell(neighbor, Some("astrometry"), true).unwrap();
    assert_eq!(ids.column("id").unwrap().to_u64_vec(), vec![next_door, edge]);
    assert_eq!(pm.column("pmra").unwrap().to_f64_vec(), vec![3.0, 7.0]);
    assert_eq!(pm.column("pmdec").unwrap().to_f64_vec(), vec![0.5, 0.5]);

    // The source cell is untouched and a rebuild does not stack.
    let home_pm = cat.fetch_cell(home, Some("astrometry"), true).unwrap();
    assert_eq!(home_pm.column("pmra").unwrap().to_f64_vec(), vec![1.0, 7.0]);
    cat.build_neighbor_cache_with(3600.0, 0.0).unwrap();
    let pm = cat.fetch_cell(neighbor, Some("astrometry"), true).unwrap();
    assert_eq!(pm.column("pmra").unwrap().to_f64_vec(), vec![3.0, 7.0]);
}

#[test]
fn test_neighbor_cache_pads_cells_without_aux_rows() {
    let dir = tempdir().unwrap();
    let (cat, [center, edge, next_door], home, neighbor) = edge_pair(dir.path());
    // Only the home cell has astrometry; the neighbor's own object has none.
    add_astrometry(&cat, home, &[1.0, 7.0]);

    let stats = cat.build_neighbor_cache_with(3600.0, 0.0).unwrap();
    assert_eq!(stats.cached_rows, 1);

    let ids = cat.fetch_cell(neighbor, None, true).unwrap();
    let pm = cat.fetch_cell(neighbor, Some("astrometry"), true).unwrap();
    assert_eq!(pm.len(), ids.len());
    assert_eq!(ids.column("id").unwrap().to_u64_vec(), vec![next_door, edge]);
    assert_eq!(pm.column("pmra").unwrap().to_f64_vec(), vec![0.0, 7.0]);

    let rows = cat
        .query(Query::select("id pmra"))
        .include_cached(true)
        .fetch()
        .unwrap();
    assert_eq!(rows.len(), 4);
    let id = rows.column("id").unwrap().to_u64_vec();
    let pmra = rows.column("pmra").unwrap().to_f64_vec();
    for (id, pmra) in id.iter().zip(&pmra) {
        let expected = match *id {
            i if i == center => 1.0,
            i if i == edge => 7.0,
            _ => 0.0,
        };
        assert_eq!(*pmra, expected, "pmra of {id:#x}");
    }
}
