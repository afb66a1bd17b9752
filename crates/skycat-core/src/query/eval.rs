//! Per-cell evaluation of a bound query.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Error, SchemaError};
use crate::geometry::{Footprint, sky};
use crate::table::{ColumnData, RowBlock, Value};
use crate::types::{CACHED_COLUMN, CellId, ValueKind};

use super::join::{in_array, table_join};
use super::plan::{BoundExpr, QueryPlan};

/// Row alignment of one catalog against the output rows.
struct Alignment {
    /// Row in the catalog's tablets backing each output row.
    idx: Vec<usize>,
    /// Output rows with no backing row (unmatched outer join).
    is_null: Vec<bool>,
    /// Raw tablets loaded so far, by table name.
    tables: HashMap<String, RowBlock>,
}

/// Working state for evaluating one plan over one cell.
struct CellQuery<'a> {
    plan: &'a QueryPlan,
    cell: CellId,
    n: usize,
    aligned: Vec<Alignment>,
    columns: HashMap<usize, ColumnData>,
}

/// Run `plan` over one cell.
///
/// Primary rows are restricted to `bounds` (when the cell is only partly
/// covered) and to non-cached rows unless `include_cached` is set. Joined
/// catalogs are then matched through their link tables, the select list is
/// evaluated, and the filter applied.
pub fn evaluate(
    plan: &QueryPlan,
    cell: CellId,
    bounds: Option<&Footprint>,
    include_cached: bool,
) -> Result<RowBlock, Error> {
    let mut q = CellQuery::load(plan, cell, bounds, include_cached)?;
    q.join()?;
    q.rows()
}

impl<'a> CellQuery<'a> {
    fn load(
        plan: &'a QueryPlan,
        cell: CellId,
        bounds: Option<&Footprint>,
        include_cached: bool,
    ) -> Result<Self, Error> {
        let primary = &plan.catalogs[0];
        let schema = primary
            .meta
            .primary_schema()
            .ok_or(SchemaError::NoPrimaryTable)?;
        let table = primary
            .meta
            .primary_table
            .clone()
            .ok_or(SchemaError::NoPrimaryTable)?;
        let raw = primary.catalog.fetch_cell(cell, Some(&table), true)?;

        let mut keep = vec![true; raw.len()];
        if !include_cached && let Some(cached) = raw.column(CACHED_COLUMN) {
            for (k, c) in keep.iter_mut().zip(cached.to_bool_vec()) {
                *k &= !c;
            }
        }
        if let (Some(bounds), Some((ra_key, dec_key))) = (bounds, &schema.spatial_keys) {
            let ra = column_of(&raw, &table, ra_key)?.to_f64_vec();
            let dec = column_of(&raw, &table, dec_key)?.to_f64_vec();
            for (k, (ra, dec)) in keep.iter_mut().zip(ra.into_iter().zip(dec)) {
                if *k {
                    let (x, y) = sky::project(ra, dec);
                    *k = bounds.contains(x, y);
                }
            }
        }

        let idx: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| k.then_some(i))
            .collect();
        let n = idx.len();
        Ok(Self {
            plan,
            cell,
            n,
            aligned: vec![Alignment {
                idx,
                is_null: vec![false; n],
                tables: HashMap::from([(table, raw)]),
            }],
            columns: HashMap::new(),
        })
    }

    /// Match each joined catalog in turn, re-aligning the catalogs already
    /// joined to the new row order.
    fn join(&mut self) -> Result<(), Error> {
        let plan = self.plan;
        let primary = &plan.catalogs[0];
        let Some(pk) = primary
            .meta
            .primary_schema()
            .and_then(|s| s.primary_key.clone())
        else {
            return Ok(());
        };
        if plan.catalogs.len() < 2 {
            return Ok(());
        }
        let primary_table = primary.meta.primary_table.clone().unwrap_or_default();
        let raw_ids = column_of(&self.aligned[0].tables[&primary_table], &primary_table, &pk)?
            .to_u64_vec();
        let mut keys: Vec<u64> = self.aligned[0].idx.iter().map(|&i| raw_ids[i]).collect();

        for bound in &plan.catalogs[1..] {
            let link_table = bound.link_table.as_deref().unwrap_or_default();
            let link = primary.catalog.fetch_cell(self.cell, Some(link_table), true)?;
            let (m1, m2) = if link.is_empty() {
                (Vec::new(), Vec::new())
            } else {
                let id1 = column_of(&link, link_table, "id1")?.to_u64_vec();
                let id2 = column_of(&link, link_table, "id2")?.to_u64_vec();
                let ok = in_array(&id1, &keys);
                id1.into_iter()
                    .zip(id2)
                    .zip(ok)
                    .filter_map(|(pair, ok)| ok.then_some(pair))
                    .unzip()
            };

            let other_table = bound
                .meta
                .primary_table
                .clone()
                .ok_or(SchemaError::NoPrimaryTable)?;
            let other_pk = bound
                .meta
                .primary_schema()
                .and_then(|s| s.primary_key.clone())
                .ok_or(SchemaError::NoPrimaryTable)?;
            let rows2 = bound.catalog.fetch_cell(self.cell, Some(&other_table), true)?;
            let id2 = if rows2.is_empty() {
                Vec::new()
            } else {
                column_of(&rows2, &other_table, &other_pk)?.to_u64_vec()
            };

            let jm = table_join(&keys, &id2, &m1, &m2, bound.join);
            for a in &mut self.aligned {
                a.idx = jm.left.iter().map(|&l| a.idx[l]).collect();
                a.is_null = jm.left.iter().map(|&l| a.is_null[l]).collect();
            }
            keys = jm.left.iter().map(|&l| keys[l]).collect();
            self.aligned.push(Alignment {
                idx: jm.right,
                is_null: jm.is_null,
                tables: HashMap::from([(other_table, rows2)]),
            });
        }
        self.n = keys.len();
        Ok(())
    }

    /// The values of symbol `slot` for every output row.
    fn symbol(&mut self, slot: usize) -> Result<ColumnData, Error> {
        if let Some(col) = self.columns.get(&slot) {
            return Ok(col.clone());
        }
        let plan = self.plan;
        let sym = &plan.symbols[slot];
        let a = &mut self.aligned[sym.catalog];
        if !a.tables.contains_key(&sym.table) {
            let rows = plan.catalogs[sym.catalog]
                .catalog
                .fetch_cell(self.cell, Some(&sym.table), true)?;
            a.tables.insert(sym.table.clone(), rows);
        }
        let rows = &a.tables[&sym.table];
        let col = match rows.column(&sym.column) {
            Some(src) => gather(src, &a.idx, &a.is_null),
            None => ColumnData::zeros(sym.ty, self.n),
        };
        self.columns.insert(slot, col.clone());
        Ok(col)
    }

    fn eval(&mut self, e: &BoundExpr) -> Result<ColumnData, Error> {
        Ok(match e {
            BoundExpr::Symbol(s) => self.symbol(*s)?,
            BoundExpr::Literal(v) => ColumnData::broadcast(*v, self.n),
            BoundExpr::Add(a, b) => {
                arith(&self.eval(a)?, &self.eval(b)?, i64::wrapping_add, |x, y| x + y)
            }
            BoundExpr::Sub(a, b) => {
                arith(&self.eval(a)?, &self.eval(b)?, i64::wrapping_sub, |x, y| x - y)
            }
            BoundExpr::Mul(a, b) => {
                arith(&self.eval(a)?, &self.eval(b)?, i64::wrapping_mul, |x, y| x * y)
            }
            BoundExpr::Div(a, b) => {
                let (x, y) = (self.eval(a)?.to_f64_vec(), self.eval(b)?.to_f64_vec());
                ColumnData::Float(x.iter().zip(&y).map(|(x, y)| x / y).collect())
            }
            BoundExpr::Neg(a) => match self.eval(a)? {
                ColumnData::Float(v) => ColumnData::Float(v.into_iter().map(|x| -x).collect()),
                other => {
                    ColumnData::Int(other.to_i64_vec().into_iter().map(i64::wrapping_neg).collect())
                }
            },
            BoundExpr::Eq(a, b) => self.compare(a, b, |o| o.is_eq(), true)?,
            BoundExpr::Ne(a, b) => self.compare(a, b, |o| o.is_ne(), false)?,
            BoundExpr::Lt(a, b) => self.compare(a, b, |o| o.is_lt(), true)?,
            BoundExpr::Le(a, b) => self.compare(a, b, |o| o.is_le(), true)?,
            BoundExpr::Gt(a, b) => self.compare(a, b, |o| o.is_gt(), true)?,
            BoundExpr::Ge(a, b) => self.compare(a, b, |o| o.is_ge(), true)?,
            BoundExpr::Between(v, lo, hi) => {
                let v = self.eval(v)?;
                let lower = compare(&self.eval(lo)?, &v, Ordering::is_le, true);
                let upper = compare(&v, &self.eval(hi)?, Ordering::is_le, true);
                ColumnData::Bool(zip_bools(lower, upper, |a, b| a && b))
            }
            BoundExpr::And(es) => {
                let mut acc = vec![true; self.n];
                for e in es {
                    let m = self.eval(e)?.to_bool_vec();
                    acc.iter_mut().zip(m).for_each(|(a, m)| *a &= m);
                }
                ColumnData::Bool(acc)
            }
            BoundExpr::Or(es) => {
                let mut acc = vec![false; self.n];
                for e in es {
                    let m = self.eval(e)?.to_bool_vec();
                    acc.iter_mut().zip(m).for_each(|(a, m)| *a |= m);
                }
                ColumnData::Bool(acc)
            }
            BoundExpr::Not(a) => {
                ColumnData::Bool(self.eval(a)?.to_bool_vec().into_iter().map(|b| !b).collect())
            }
        })
    }

    fn compare(
        &mut self,
        a: &BoundExpr,
        b: &BoundExpr,
        test: fn(Ordering) -> bool,
        nan_false: bool,
    ) -> Result<ColumnData, Error> {
        let (a, b) = (self.eval(a)?, self.eval(b)?);
        Ok(compare(&a, &b, test, nan_false))
    }

    fn rows(mut self) -> Result<RowBlock, Error> {
        let plan = self.plan;
        if self.n == 0 {
            return Ok(RowBlock::empty(&plan.output_schema()));
        }
        let mut out = RowBlock::new();
        for o in &plan.outputs {
            let data = self.eval(&o.expr)?;
            out.push_column(o.name.clone(), o.ty, data)?;
        }
        match &plan.filter {
            Some(f) => {
                let mask = self.eval(f)?.to_bool_vec();
                Ok(out.filter(&mask))
            }
            None => Ok(out),
        }
    }
}

fn column_of<'r>(rows: &'r RowBlock, table: &str, column: &str) -> Result<&'r ColumnData, Error> {
    rows.column(column).ok_or_else(|| {
        SchemaError::ColumnNotFound {
            table: table.to_string(),
            column: column.to_string(),
        }
        .into()
    })
}

/// Gather `src[idx[i]]`, reading zero for null rows and out-of-range indices.
fn gather(src: &ColumnData, idx: &[usize], is_null: &[bool]) -> ColumnData {
    let len = src.len();
    if is_null.iter().all(|n| !n) && idx.iter().all(|&i| i < len) {
        return src.take(idx);
    }
    let mut out = match src.kind() {
        ValueKind::Bool => ColumnData::Bool(Vec::with_capacity(idx.len())),
        ValueKind::Int => ColumnData::Int(Vec::with_capacity(idx.len())),
        ValueKind::UInt => ColumnData::UInt(Vec::with_capacity(idx.len())),
        ValueKind::Float => ColumnData::Float(Vec::with_capacity(idx.len())),
    };
    for (&i, &null) in idx.iter().zip(is_null) {
        if null || i >= len {
            out.push(Value::Int(0));
        } else {
            out.push(src.get(i));
        }
    }
    out
}

fn integral(c: &ColumnData) -> bool {
    c.kind() != ValueKind::Float
}

fn arith(
    a: &ColumnData,
    b: &ColumnData,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> ColumnData {
    if integral(a) && integral(b) {
        let (x, y) = (a.to_i64_vec(), b.to_i64_vec());
        ColumnData::Int(x.into_iter().zip(y).map(|(x, y)| int_op(x, y)).collect())
    } else {
        let (x, y) = (a.to_f64_vec(), b.to_f64_vec());
        ColumnData::Float(x.into_iter().zip(y).map(|(x, y)| float_op(x, y)).collect())
    }
}

fn as_i128(v: Value) -> i128 {
    match v {
        Value::Bool(b) => i128::from(b),
        Value::Int(x) => i128::from(x),
        Value::UInt(x) => i128::from(x),
        Value::Float(x) => x as i128,
    }
}

/// Element-wise comparison. Integral operands compare exactly; anything
/// involving a float compares as `f64`, where NaN yields `!nan_false`.
fn compare(
    a: &ColumnData,
    b: &ColumnData,
    test: fn(Ordering) -> bool,
    nan_false: bool,
) -> ColumnData {
    let n = a.len().min(b.len());
    let out = if integral(a) && integral(b) {
        (0..n)
            .map(|i| test(as_i128(a.get(i)).cmp(&as_i128(b.get(i)))))
            .collect()
    } else {
        let (x, y) = (a.to_f64_vec(), b.to_f64_vec());
        x.iter()
            .zip(&y)
            .map(|(x, y)| x.partial_cmp(y).map_or(!nan_false, test))
            .collect()
    };
    ColumnData::Bool(out)
}

fn zip_bools(a: ColumnData, b: ColumnData, f: impl Fn(bool, bool) -> bool) -> Vec<bool> {
    a.to_bool_vec()
        .into_iter()
        .zip(b.to_bool_vec())
        .map(|(a, b)| f(a, b))
        .collect()
}
