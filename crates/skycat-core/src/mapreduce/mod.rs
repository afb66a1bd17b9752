//! Parallel map-reduce over catalog cells.
//!
//! A job evaluates a bound query on every partition of a footprint, hands
//! each non-empty row set to a mapper, and either streams the mapper's output
//! or groups it by key and streams reducer results. A failing partition or
//! key becomes one `Err` item; the rest of the job still runs.

pub mod halo;
pub mod pool;

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{info, warn};

use crate::api::Catalog;
use crate::catalog::Partition;
use crate::error::{Error, JobError, Result};
use crate::geometry::Footprint;
use crate::query::{QueryPlan, evaluate};
use crate::table::RowBlock;
use crate::types::CellId;

pub use halo::HaloStats;
pub use pool::PoolStream;

/// What a mapper produced for one partition.
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution<T> {
    /// Items to pass on, in order.
    Emit(Vec<T>),
    /// Nothing to contribute.
    Skip,
}

impl<T> Contribution<T> {
    pub fn one(item: T) -> Self {
        Contribution::Emit(vec![item])
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            Contribution::Emit(items) => items,
            Contribution::Skip => Vec::new(),
        }
    }
}

impl<T> From<Vec<T>> for Contribution<T> {
    fn from(items: Vec<T>) -> Self {
        Contribution::Emit(items)
    }
}

/// The partition a mapper is running on.
#[derive(Debug, Clone)]
pub struct MapContext {
    pub cell_id: CellId,
    pub catalog: Catalog,
    /// Part of the cell covered by the query, `None` if all of it.
    pub footprint: Option<Footprint>,
}

/// Context handed to reducers.
#[derive(Debug, Clone)]
pub struct ReduceContext {
    pub catalog: Catalog,
}

/// Post-processing applied to each partition's rows before the mapper.
pub type RowFilter = Arc<dyn Fn(RowBlock) -> Result<RowBlock> + Send + Sync>;

/// Everything a worker needs to evaluate one partition.
#[derive(Clone)]
pub(crate) struct JobSpec {
    pub catalog: Catalog,
    pub plan: Arc<QueryPlan>,
    pub include_cached: bool,
    pub row_filter: Option<RowFilter>,
    pub workers: usize,
    pub buffer: usize,
}

impl JobSpec {
    fn rows(&self, part: &Partition) -> Result<RowBlock> {
        let rows = evaluate(
            &self.plan,
            part.cell_id,
            part.bounds.as_ref(),
            self.include_cached,
        )?;
        match &self.row_filter {
            Some(filter) if !rows.is_empty() => filter(rows),
            _ => Ok(rows),
        }
    }
}

/// Flattened mapper output across partitions.
pub struct JobStream<T> {
    partitions: PoolStream<Result<Vec<T>>>,
    pending: std::vec::IntoIter<T>,
}

impl<T> Iterator for JobStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(Ok(item));
            }
            match self.partitions.next()? {
                Ok(items) => self.pending = items.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Run `mapper` on every partition with rows.
pub(crate) fn run_map<T, M>(
    spec: JobSpec,
    partitions: Vec<Partition>,
    mapper: M,
) -> Result<JobStream<T>>
where
    T: Send + 'static,
    M: Fn(&MapContext, RowBlock) -> Result<Contribution<T>> + Send + Sync + 'static,
{
    info!(
        partitions = partitions.len(),
        workers = spec.workers,
        catalog = %spec.catalog.name(),
        "starting map job"
    );
    let (workers, buffer) = (spec.workers, spec.buffer);
    let stream = pool::spawn(partitions, workers, buffer, move |part: Partition| {
        let cell_id = part.cell_id;
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Vec<T>> {
            let rows = spec.rows(&part)?;
            if rows.is_empty() {
                return Ok(Vec::new());
            }
            let ctx = MapContext {
                cell_id,
                catalog: spec.catalog.clone(),
                footprint: part.bounds,
            };
            Ok(mapper(&ctx, rows)?.into_items())
        }));
        let message = match outcome {
            Ok(Ok(items)) => return Ok(items),
            Ok(Err(e)) => e.to_string(),
            Err(payload) => pool::panic_message(payload),
        };
        warn!(cell = %cell_id, error = %message, "partition failed");
        Err(JobError::Partition { cell_id, message }.into())
    })?;
    Ok(JobStream {
        partitions: stream,
        pending: Vec::new().into_iter(),
    })
}

type Launch<K, V, R> =
    Box<dyn FnOnce(Vec<(K, Vec<V>)>) -> Result<PoolStream<Result<R>>> + Send>;

/// Reducer results, one per distinct key.
///
/// The map phase runs to completion on the first call to `next`; map
/// failures are yielded first, then reducer results as they finish.
pub struct ReduceStream<K, V, R> {
    map: Option<JobStream<(K, V)>>,
    launch: Option<Launch<K, V, R>>,
    errors: VecDeque<Error>,
    results: Option<PoolStream<Result<R>>>,
}

impl<K: Eq + Hash + Clone, V, R> ReduceStream<K, V, R> {
    fn shuffle(&mut self, map: JobStream<(K, V)>) -> Vec<(K, Vec<V>)> {
        let mut groups: Vec<(K, Vec<V>)> = Vec::new();
        let mut index: HashMap<K, usize> = HashMap::new();
        for item in map {
            match item {
                Ok((key, value)) => match index.get(&key) {
                    Some(&i) => groups[i].1.push(value),
                    None => {
                        index.insert(key.clone(), groups.len());
                        groups.push((key, vec![value]));
                    }
                },
                Err(e) => self.errors.push_back(e),
            }
        }
        groups
    }
}

impl<K: Eq + Hash + Clone, V, R> Iterator for ReduceStream<K, V, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Result<R>> {
        if let Some(map) = self.map.take() {
            let groups = self.shuffle(map);
            if let Some(launch) = self.launch.take() {
                match launch(groups) {
                    Ok(results) => self.results = Some(results),
                    Err(e) => self.errors.push_back(e),
                }
            }
        }
        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }
        self.results.as_mut()?.next()
    }
}

/// Run `mapper` on every partition, group its `(key, value)` pairs by key,
/// and run `reducer` once per key.
pub(crate) fn run_map_reduce<K, V, R, M, F>(
    spec: JobSpec,
    partitions: Vec<Partition>,
    mapper: M,
    reducer: F,
) -> Result<ReduceStream<K, V, R>>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Send + 'static,
    R: Send + 'static,
    M: Fn(&MapContext, RowBlock) -> Result<Contribution<(K, V)>> + Send + Sync + 'static,
    F: Fn(&ReduceContext, K, Vec<V>) -> Result<R> + Send + Sync + 'static,
{
    let ctx = ReduceContext {
        catalog: spec.catalog.clone(),
    };
    let (workers, buffer) = (spec.workers, spec.buffer);
    let map = run_map(spec, partitions, mapper)?;
    let launch: Launch<K, V, R> = Box::new(move |groups: Vec<(K, Vec<V>)>| {
        info!(keys = groups.len(), "starting reduce phase");
        pool::spawn(groups, workers, buffer, move |(key, values): (K, Vec<V>)| {
            let label = format!("{key:?}");
            let message = match catch_unwind(AssertUnwindSafe(|| reducer(&ctx, key, values))) {
                Ok(Ok(r)) => return Ok(r),
                Ok(Err(e)) => e.to_string(),
                Err(payload) => pool::panic_message(payload),
            };
            warn!(key = %label, error = %message, "reducer failed");
            Err(JobError::Reduce(format!("key {label}: {message}")).into())
        })
    });
    Ok(ReduceStream {
        map: Some(map),
        launch: Some(launch),
        errors: VecDeque::new(),
        results: None,
    })
}
