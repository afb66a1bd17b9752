use std::sync::Arc;

use crate::error::{Error, Result};
use crate::geometry::Footprint;
use crate::mapreduce::{
    self, Contribution, JobSpec, JobStream, MapContext, ReduceContext, ReduceStream, RowFilter,
};
use crate::query::{Query, QueryPlan};
use crate::table::{Row, RowBlock};
use crate::types::{ColumnType, TableSchema};

use super::catalog::Catalog;

// ---------------------------------------------------------------------------
// TableBuilder
// ---------------------------------------------------------------------------

/// Builder for creating a new table.
///
/// A table with a primary key becomes the catalog's primary table; it must
/// also declare spatial keys, and gains a `cached` flag column.
pub struct TableBuilder<'a> {
    catalog: &'a Catalog,
    name: String,
    columns: Vec<(String, ColumnType)>,
    primary_key: Option<String>,
    spatial_keys: Option<(String, String)>,
    temporal_key: Option<String>,
    if_not_exists: bool,
}

impl<'a> TableBuilder<'a> {
    pub(crate) fn new(catalog: &'a Catalog, name: String) -> Self {
        Self {
            catalog,
            name,
            columns: Vec::new(),
            primary_key: None,
            spatial_keys: None,
            temporal_key: None,
            if_not_exists: false,
        }
    }

    /// Add a column.
    pub fn column(mut self, name: &str, ty: ColumnType) -> Self {
        self.columns.push((name.to_string(), ty));
        self
    }

    /// Add several columns at once.
    pub fn columns<'c>(mut self, columns: impl IntoIterator<Item = (&'c str, ColumnType)>) -> Self {
        self.columns
            .extend(columns.into_iter().map(|(n, ty)| (n.to_string(), ty)));
        self
    }

    /// Column receiving generated row ids; makes this the primary table.
    pub fn primary_key(mut self, name: &str) -> Self {
        self.primary_key = Some(name.to_string());
        self
    }

    /// `(ra, dec)` columns, in degrees.
    pub fn spatial_keys(mut self, ra: &str, dec: &str) -> Self {
        self.spatial_keys = Some((ra.to_string(), dec.to_string()));
        self
    }

    /// Observation time column (MJD).
    pub fn temporal_key(mut self, name: &str) -> Self {
        self.temporal_key = Some(name.to_string());
        self
    }

    /// Succeed without changes if the table already exists.
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    /// Execute the table creation.
    pub fn execute(self) -> Result<()> {
        let schema = TableSchema {
            columns: self.columns,
            primary_key: self.primary_key,
            spatial_keys: self.spatial_keys,
            temporal_key: self.temporal_key,
        };
        self.catalog
            .register_table(&self.name, schema, self.if_not_exists)
    }
}

// ---------------------------------------------------------------------------
// JobBuilder
// ---------------------------------------------------------------------------

/// Builder for a query job over a catalog.
///
/// Configure the footprint and options, then finish with [`fetch`](Self::fetch),
/// [`iterate`](Self::iterate), [`iterate_rows`](Self::iterate_rows),
/// [`map`](Self::map), or [`map_reduce`](Self::map_reduce).
pub struct JobBuilder {
    catalog: Catalog,
    query: Query,
    footprint: Option<Footprint>,
    include_cached: bool,
    test_bounds: bool,
    workers: Option<usize>,
    row_filter: Option<RowFilter>,
}

impl JobBuilder {
    pub(crate) fn new(catalog: Catalog, query: Query) -> Self {
        Self {
            catalog,
            query,
            footprint: None,
            include_cached: false,
            test_bounds: true,
            workers: None,
            row_filter: None,
        }
    }

    /// Restrict the job to a region of the sky. Defaults to the whole sky.
    pub fn footprint(mut self, footprint: Footprint) -> Self {
        self.footprint = Some(footprint);
        self
    }

    /// Also return rows replicated from neighboring cells.
    pub fn include_cached(mut self, include: bool) -> Self {
        self.include_cached = include;
        self
    }

    /// Whether rows of partially covered cells are tested against the
    /// footprint (default) or all returned.
    pub fn test_bounds(mut self, test: bool) -> Self {
        self.test_bounds = test;
        self
    }

    /// Worker threads for this job, overriding the catalog configuration.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    /// Transform each partition's rows before they reach the mapper or the
    /// caller. Returning an empty block drops the partition.
    pub fn row_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(RowBlock) -> Result<RowBlock> + Send + Sync + 'static,
    {
        self.row_filter = Some(Arc::new(filter));
        self
    }

    fn prepare(self) -> Result<(JobSpec, Vec<crate::catalog::Partition>)> {
        let plan = QueryPlan::bind(&self.query, &self.catalog)?;
        let footprint = self.footprint.unwrap_or_else(Footprint::all_sky);
        let partitions = self.catalog.resolve_cells(&footprint, self.test_bounds)?;
        let config = self.catalog.config();
        let spec = JobSpec {
            workers: self.workers.unwrap_or_else(|| config.worker_count()),
            buffer: config.result_buffer,
            catalog: self.catalog.clone(),
            plan: Arc::new(plan),
            include_cached: self.include_cached,
            row_filter: self.row_filter,
        };
        Ok((spec, partitions))
    }

    /// Materialize every matching row into one block. The first partition
    /// failure aborts the fetch.
    pub fn fetch(self) -> Result<RowBlock> {
        let (spec, partitions) = self.prepare()?;
        let schema = spec.plan.output_schema();
        let mut out = RowBlock::empty(&schema);
        for block in mapreduce::run_map(spec, partitions, |_, rows| Ok(Contribution::one(rows)))? {
            out.append(&block?)?;
        }
        Ok(out)
    }

    /// Stream one non-empty block per partition, as partitions finish.
    pub fn iterate(self) -> Result<JobStream<RowBlock>> {
        let (spec, partitions) = self.prepare()?;
        mapreduce::run_map(spec, partitions, |_, rows| Ok(Contribution::one(rows)))
    }

    /// Stream individual rows.
    pub fn iterate_rows(self) -> Result<impl Iterator<Item = Result<Row>>> {
        let blocks = self.iterate()?;
        Ok(blocks.flat_map(|block| -> Box<dyn Iterator<Item = Result<Row>>> {
            match block {
                Ok(block) => Box::new(block.into_rows().map(Ok)),
                Err(e) => Box::new(std::iter::once(Err::<Row, Error>(e))),
            }
        }))
    }

    /// Run `mapper` on every partition and stream what it emits.
    pub fn map<T, M>(self, mapper: M) -> Result<JobStream<T>>
    where
        T: Send + 'static,
        M: Fn(&MapContext, RowBlock) -> Result<Contribution<T>> + Send + Sync + 'static,
    {
        let (spec, partitions) = self.prepare()?;
        mapreduce::run_map(spec, partitions, mapper)
    }

    /// Run `mapper` on every partition, then `reducer` once per distinct key
    /// of the emitted `(key, value)` pairs.
    pub fn map_reduce<K, V, R, M, F>(self, mapper: M, reducer: F) -> Result<ReduceStream<K, V, R>>
    where
        K: Eq + std::hash::Hash + Clone + std::fmt::Debug + Send + 'static,
        V: Send + 'static,
        R: Send + 'static,
        M: Fn(&MapContext, RowBlock) -> Result<Contribution<(K, V)>> + Send + Sync + 'static,
        F: Fn(&ReduceContext, K, Vec<V>) -> Result<R> + Send + Sync + 'static,
    {
        let (spec, partitions) = self.prepare()?;
        mapreduce::run_map_reduce(spec, partitions, mapper, reducer)
    }
}
