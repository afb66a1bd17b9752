//! Query description and bind-time resolution of column references.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::api::Catalog;
use crate::catalog::CatalogMeta;
use crate::error::{Error, QueryError, SchemaError};
use crate::table::Value;
use crate::types::{ColumnType, ValueKind};

use super::expr::{Expr, MAX_EXPRESSION_DEPTH};

/// How rows of a joined catalog are matched to primary rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JoinType {
    /// Keep only primary rows with a match.
    Inner,
    /// Keep every primary row; unmatched rows read zeros for the joined catalog.
    #[default]
    Outer,
}

#[derive(Debug, Clone, PartialEq)]
enum SelectItem {
    /// A column name or wildcard token (`ra`, `*`, `sdss.*`, `sdss.ra`).
    Token(String),
    Computed { alias: String, expr: Expr },
}

/// A select list, filter, and joins, independent of any particular catalog.
///
/// ```
/// use skycat_core::query::{Expr, JoinType, Query};
///
/// let q = Query::select("ra dec sdss.*")
///     .select_expr("color", Expr::sub(Expr::col("g"), Expr::col("r")))
///     .join("sdss", JoinType::Inner)
///     .filter(Expr::lt(Expr::col("r"), Expr::lit(21.5)));
/// # let _ = q;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    items: Vec<SelectItem>,
    filter: Option<Expr>,
    joins: Vec<(String, JoinType)>,
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl Query {
    /// Select a whitespace-separated list of columns and wildcards.
    pub fn select(columns: &str) -> Self {
        Self {
            items: Vec::new(),
            filter: None,
            joins: Vec::new(),
        }
        .columns(columns)
    }

    /// Every column of the primary catalog.
    pub fn all() -> Self {
        Self::select("*")
    }

    /// Append more columns to the select list.
    pub fn columns(mut self, columns: &str) -> Self {
        self.items.extend(
            columns
                .split_whitespace()
                .map(|t| SelectItem::Token(t.to_string())),
        );
        self
    }

    /// Append a computed column.
    pub fn select_expr(mut self, alias: impl Into<String>, expr: Expr) -> Self {
        self.items.push(SelectItem::Computed {
            alias: alias.into(),
            expr,
        });
        self
    }

    /// Restrict rows with a predicate. Repeated calls are AND-ed.
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(Expr::And(mut all)) => {
                all.push(predicate);
                Expr::And(all)
            }
            Some(prev) => Expr::And(vec![prev, predicate]),
            None => predicate,
        });
        self
    }

    /// Join a cross-matched catalog. Catalogs referenced in the select list
    /// or filter without an explicit join are outer-joined.
    pub fn join(mut self, catalog: impl Into<String>, join_type: JoinType) -> Self {
        self.joins.push((catalog.into(), join_type));
        self
    }
}

/// A column reference resolved to a concrete table of a bound catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    /// Index into [`QueryPlan::catalogs`]; 0 is the primary catalog.
    pub catalog: usize,
    pub table: String,
    pub column: String,
    pub ty: ColumnType,
}

/// An expression with every column replaced by a symbol slot.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    Symbol(usize),
    Literal(Value),
    Add(Box<BoundExpr>, Box<BoundExpr>),
    Sub(Box<BoundExpr>, Box<BoundExpr>),
    Mul(Box<BoundExpr>, Box<BoundExpr>),
    Div(Box<BoundExpr>, Box<BoundExpr>),
    Neg(Box<BoundExpr>),
    Eq(Box<BoundExpr>, Box<BoundExpr>),
    Ne(Box<BoundExpr>, Box<BoundExpr>),
    Lt(Box<BoundExpr>, Box<BoundExpr>),
    Le(Box<BoundExpr>, Box<BoundExpr>),
    Gt(Box<BoundExpr>, Box<BoundExpr>),
    Ge(Box<BoundExpr>, Box<BoundExpr>),
    Between(Box<BoundExpr>, Box<BoundExpr>, Box<BoundExpr>),
    And(Vec<BoundExpr>),
    Or(Vec<BoundExpr>),
    Not(Box<BoundExpr>),
}

/// A catalog taking part in a query.
#[derive(Debug, Clone)]
pub struct BoundCatalog {
    /// Name used to qualify columns (empty for the primary catalog).
    pub name: String,
    pub catalog: Catalog,
    pub meta: CatalogMeta,
    pub join: JoinType,
    /// Link table in the primary catalog (joined catalogs only).
    pub link_table: Option<String>,
}

/// One output column of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    pub expr: BoundExpr,
    pub ty: ColumnType,
}

/// A [`Query`] bound to a catalog: every reference resolved, every output
/// typed. Binding fails early on unknown catalogs or columns.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub(crate) catalogs: Vec<BoundCatalog>,
    pub(crate) symbols: Vec<Symbol>,
    pub(crate) outputs: Vec<OutputColumn>,
    pub(crate) filter: Option<BoundExpr>,
}

fn is_integral(ty: ColumnType) -> bool {
    ty.kind() != ValueKind::Float
}

fn literal_type(v: Value) -> ColumnType {
    match v {
        Value::Bool(_) => ColumnType::Bool,
        Value::Int(_) => ColumnType::I64,
        Value::UInt(_) => ColumnType::U64,
        Value::Float(_) => ColumnType::F64,
    }
}

struct Binder {
    catalogs: Vec<BoundCatalog>,
    symbols: Vec<Symbol>,
    slots: HashMap<(usize, String), usize>,
    explicit: Vec<(String, JoinType)>,
    aliases: HashMap<String, BoundExpr>,
}

impl Binder {
    fn catalog_index(&mut self, name: &str) -> Result<usize, Error> {
        if name.is_empty() || name == self.catalogs[0].meta.name {
            return Ok(0);
        }
        if let Some(i) = self.catalogs.iter().position(|c| c.name == name) {
            return Ok(i);
        }
        let root = &self.catalogs[0];
        let link_table = root
            .meta
            .xmatch
            .get(name)
            .map(|x| x.table.clone())
            .ok_or_else(|| SchemaError::UnknownCatalog(name.to_string()))?;
        let catalog = root.catalog.xmatched_catalog(name)?;
        let meta = catalog.meta();
        let join = self
            .explicit
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, j)| *j)
            .unwrap_or_default();
        self.catalogs.push(BoundCatalog {
            name: name.to_string(),
            catalog,
            meta,
            join,
            link_table: Some(link_table),
        });
        Ok(self.catalogs.len() - 1)
    }

    /// Find `column` among the row-aligned tables of catalog `cat`.
    fn lookup(&self, cat: usize, column: &str) -> Option<(String, ColumnType)> {
        let meta = &self.catalogs[cat].meta;
        meta.aligned_tables().into_iter().find_map(|table| {
            let ty = meta.tables.get(&table)?.column_type(column)?;
            Some((table, ty))
        })
    }

    fn symbol(&mut self, cat: usize, table: String, column: &str, ty: ColumnType) -> usize {
        let key = (cat, format!("{table}.{column}"));
        if let Some(&slot) = self.slots.get(&key) {
            return slot;
        }
        self.symbols.push(Symbol {
            catalog: cat,
            table,
            column: column.to_string(),
            ty,
        });
        self.slots.insert(key, self.symbols.len() - 1);
        self.symbols.len() - 1
    }

    fn resolve(&mut self, name: &str) -> Result<usize, Error> {
        if let Some((cat_name, column)) = name.split_once('.') {
            let cat = self.catalog_index(cat_name)?;
            let (table, ty) = self
                .lookup(cat, column)
                .ok_or_else(|| QueryError::UnknownColumn(name.to_string()))?;
            return Ok(self.symbol(cat, table, column, ty));
        }
        for cat in 0..self.catalogs.len() {
            if let Some((table, ty)) = self.lookup(cat, name) {
                return Ok(self.symbol(cat, table, name, ty));
            }
        }
        Err(QueryError::UnknownColumn(name.to_string()).into())
    }

    fn bind(&mut self, e: &Expr, depth: usize) -> Result<BoundExpr, Error> {
        if depth > MAX_EXPRESSION_DEPTH {
            return Err(QueryError::InvalidExpression(format!(
                "expression depth exceeds maximum of {MAX_EXPRESSION_DEPTH}"
            ))
            .into());
        }
        let d = depth + 1;
        Ok(match e {
            Expr::Column(name) => match self.aliases.get(name) {
                Some(bound) => bound.clone(),
                None => BoundExpr::Symbol(self.resolve(name)?),
            },
            Expr::Literal(v) => BoundExpr::Literal(*v),
            Expr::Add(x, y) => BoundExpr::Add(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Sub(x, y) => BoundExpr::Sub(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Mul(x, y) => BoundExpr::Mul(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Div(x, y) => BoundExpr::Div(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Neg(x) => BoundExpr::Neg(self.boxed(x, d)?),
            Expr::Eq(x, y) => BoundExpr::Eq(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Ne(x, y) => BoundExpr::Ne(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Lt(x, y) => BoundExpr::Lt(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Le(x, y) => BoundExpr::Le(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Gt(x, y) => BoundExpr::Gt(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Ge(x, y) => BoundExpr::Ge(self.boxed(x, d)?, self.boxed(y, d)?),
            Expr::Between(v, lo, hi) => BoundExpr::Between(
                self.boxed(v, d)?,
                self.boxed(lo, d)?,
                self.boxed(hi, d)?,
            ),
            Expr::Not(x) => BoundExpr::Not(self.boxed(x, d)?),
            Expr::And(xs) => BoundExpr::And(
                xs.iter()
                    .map(|x| self.bind(x, d))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Or(xs) => BoundExpr::Or(
                xs.iter()
                    .map(|x| self.bind(x, d))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    fn boxed(&mut self, e: &Expr, depth: usize) -> Result<Box<BoundExpr>, Error> {
        Ok(Box::new(self.bind(e, depth)?))
    }

    fn type_of(&self, e: &BoundExpr) -> ColumnType {
        match e {
            BoundExpr::Symbol(s) => self.symbols[*s].ty,
            BoundExpr::Literal(v) => literal_type(*v),
            BoundExpr::Add(a, b) | BoundExpr::Sub(a, b) | BoundExpr::Mul(a, b) => {
                if is_integral(self.type_of(a)) && is_integral(self.type_of(b)) {
                    ColumnType::I64
                } else {
                    ColumnType::F64
                }
            }
            BoundExpr::Div(_, _) => ColumnType::F64,
            BoundExpr::Neg(a) => {
                if is_integral(self.type_of(a)) {
                    ColumnType::I64
                } else {
                    ColumnType::F64
                }
            }
            _ => ColumnType::Bool,
        }
    }

    fn references_primary(&self, e: &BoundExpr) -> bool {
        match e {
            BoundExpr::Symbol(s) => self.symbols[*s].catalog == 0,
            BoundExpr::Literal(_) => false,
            BoundExpr::Neg(a) | BoundExpr::Not(a) => self.references_primary(a),
            BoundExpr::Add(a, b)
            | BoundExpr::Sub(a, b)
            | BoundExpr::Mul(a, b)
            | BoundExpr::Div(a, b)
            | BoundExpr::Eq(a, b)
            | BoundExpr::Ne(a, b)
            | BoundExpr::Lt(a, b)
            | BoundExpr::Le(a, b)
            | BoundExpr::Gt(a, b)
            | BoundExpr::Ge(a, b) => self.references_primary(a) || self.references_primary(b),
            BoundExpr::Between(v, lo, hi) => {
                self.references_primary(v)
                    || self.references_primary(lo)
                    || self.references_primary(hi)
            }
            BoundExpr::And(es) | BoundExpr::Or(es) => es.iter().any(|e| self.references_primary(e)),
        }
    }

    /// Expand one select token into `(output name, column reference)` pairs.
    fn expand(&mut self, token: &str) -> Result<Vec<(String, String)>, Error> {
        let (cat_name, column) = match token.split_once('.') {
            Some((c, col)) => (c, col),
            None => ("", token),
        };
        if column != "*" {
            return Ok(vec![(token.to_string(), token.to_string())]);
        }
        let cat = self.catalog_index(cat_name)?;
        let meta = &self.catalogs[cat].meta;
        let prefix = if cat == 0 {
            String::new()
        } else {
            format!("{}.", self.catalogs[cat].name)
        };
        let mut out = Vec::new();
        for table in meta.aligned_tables() {
            if let Some(schema) = meta.tables.get(&table) {
                for name in schema.column_names() {
                    let qualified = format!("{prefix}{name}");
                    out.push((qualified.clone(), qualified));
                }
            }
        }
        Ok(out)
    }
}

impl QueryPlan {
    /// Resolve `query` against `catalog` and any cross-matched catalogs it names.
    pub fn bind(query: &Query, catalog: &Catalog) -> Result<Self, Error> {
        let meta = catalog.meta();
        if meta.primary_table.is_none() {
            return Err(SchemaError::NoPrimaryTable.into());
        }
        let mut binder = Binder {
            catalogs: vec![BoundCatalog {
                name: String::new(),
                catalog: catalog.clone(),
                meta,
                join: JoinType::Inner,
                link_table: None,
            }],
            symbols: Vec::new(),
            slots: HashMap::new(),
            explicit: query.joins.clone(),
            aliases: HashMap::new(),
        };
        for (name, _) in &query.joins {
            binder.catalog_index(name)?;
        }

        let mut outputs: Vec<OutputColumn> = Vec::new();
        let mut primary_ref = false;
        for item in &query.items {
            let pairs = match item {
                SelectItem::Token(token) => binder
                    .expand(token)?
                    .into_iter()
                    .map(|(name, col)| (name, Expr::Column(col)))
                    .collect(),
                SelectItem::Computed { alias, expr } => vec![(alias.clone(), expr.clone())],
            };
            for (name, expr) in pairs {
                if outputs.iter().any(|o| o.name == name) {
                    continue;
                }
                let bound = binder.bind(&expr, 0)?;
                primary_ref |= binder.references_primary(&bound);
                let ty = binder.type_of(&bound);
                if matches!(item, SelectItem::Computed { .. }) {
                    binder.aliases.insert(name.clone(), bound.clone());
                }
                outputs.push(OutputColumn {
                    name,
                    expr: bound,
                    ty,
                });
            }
        }
        if !primary_ref {
            return Err(SchemaError::NoPrimaryReference.into());
        }

        let filter = query
            .filter
            .as_ref()
            .map(|f| binder.bind(f, 0))
            .transpose()?;

        Ok(Self {
            catalogs: binder.catalogs,
            symbols: binder.symbols,
            outputs,
            filter,
        })
    }

    /// `(name, type)` of every output column, in select-list order.
    pub fn output_schema(&self) -> Vec<(String, ColumnType)> {
        self.outputs.iter().map(|o| (o.name.clone(), o.ty)).collect()
    }

    pub fn catalogs(&self) -> &[BoundCatalog] {
        &self.catalogs
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}
