//! Column expressions used in select lists and filters.

use serde::{Deserialize, Serialize};

use crate::table::Value;

/// An expression over the columns of a (joined) row set.
///
/// Column names are either bare (`"ra"`, resolved against the primary
/// catalog first, then joined catalogs in join order) or qualified with a
/// catalog name (`"sdss.ra"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Expr {
    // Leaf nodes
    Column(String),
    Literal(Value),

    // Arithmetic
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),

    // Comparisons
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    Between(Box<Expr>, Box<Expr>, Box<Expr>),

    // Boolean logic
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// Maximum nesting depth for expressions.
pub const MAX_EXPRESSION_DEPTH: usize = 32;

impl Expr {
    /// Column reference.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    /// Literal value.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(a: Expr, b: Expr) -> Self {
        Expr::Add(Box::new(a), Box::new(b))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(a: Expr, b: Expr) -> Self {
        Expr::Sub(Box::new(a), Box::new(b))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(a: Expr, b: Expr) -> Self {
        Expr::Mul(Box::new(a), Box::new(b))
    }

    /// `a / b`, always evaluated in floating point.
    #[allow(clippy::should_implement_trait)]
    pub fn div(a: Expr, b: Expr) -> Self {
        Expr::Div(Box::new(a), Box::new(b))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(a: Expr) -> Self {
        Expr::Neg(Box::new(a))
    }

    /// `a == b`
    pub fn eq(a: Expr, b: Expr) -> Self {
        Expr::Eq(Box::new(a), Box::new(b))
    }

    /// `a != b`
    pub fn ne(a: Expr, b: Expr) -> Self {
        Expr::Ne(Box::new(a), Box::new(b))
    }

    /// `a < b`
    pub fn lt(a: Expr, b: Expr) -> Self {
        Expr::Lt(Box::new(a), Box::new(b))
    }

    /// `a <= b`
    pub fn le(a: Expr, b: Expr) -> Self {
        Expr::Le(Box::new(a), Box::new(b))
    }

    /// `a > b`
    pub fn gt(a: Expr, b: Expr) -> Self {
        Expr::Gt(Box::new(a), Box::new(b))
    }

    /// `a >= b`
    pub fn ge(a: Expr, b: Expr) -> Self {
        Expr::Ge(Box::new(a), Box::new(b))
    }

    /// `low <= value <= high`
    pub fn between(value: Expr, low: Expr, high: Expr) -> Self {
        Expr::Between(Box::new(value), Box::new(low), Box::new(high))
    }

    pub fn and(exprs: Vec<Expr>) -> Self {
        Expr::And(exprs)
    }

    pub fn or(exprs: Vec<Expr>) -> Self {
        Expr::Or(exprs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    /// Visit every column name referenced by this expression.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Column(name) => out.push(name),
            Expr::Literal(_) => {}
            Expr::Neg(a) | Expr::Not(a) => a.collect_columns(out),
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Eq(a, b)
            | Expr::Ne(a, b)
            | Expr::Lt(a, b)
            | Expr::Le(a, b)
            | Expr::Gt(a, b)
            | Expr::Ge(a, b) => {
                a.collect_columns(out);
                b.collect_columns(out);
            }
            Expr::Between(v, lo, hi) => {
                v.collect_columns(out);
                lo.collect_columns(out);
                hi.collect_columns(out);
            }
            Expr::And(es) | Expr::Or(es) => es.iter().for_each(|e| e.collect_columns(out)),
        }
    }
}
